use crate::import::parse_timestamp;
use crate::shape::DEFAULT_DATETIME_COLUMN;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "anomaly-worker",
    version,
    about = "Incremental anomaly detection over process measurements"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Poll for new events and score them until interrupted.
    Run {
        /// Minutes between cycles; overrides ANOMALY_INTERVAL_MINUTES.
        #[arg(long)]
        interval: Option<u64>,
        /// Run a single cycle and exit.
        #[arg(long, default_value_t = false)]
        once: bool,
    },
    /// Score every event in a time range once and print a summary.
    Detect {
        #[arg(long, value_parser = timestamp_arg)]
        start: Option<DateTime<Utc>>,
        #[arg(long, value_parser = timestamp_arg)]
        end: Option<DateTime<Utc>>,
    },
    /// Load wide CSV files into the event table.
    Import {
        #[arg(long, default_value = DEFAULT_DATETIME_COLUMN)]
        datetime_column: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

impl Args {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run {
            interval: None,
            once: false,
        })
    }
}

fn timestamp_arg(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(raw).ok_or_else(|| format!("unrecognized timestamp {raw:?}"))
}
