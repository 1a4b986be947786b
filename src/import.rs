use crate::records::WideRow;
use crate::shape;
use crate::store::PgStore;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

/// RFC 3339, or one of the naive layouts above read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .map(|naive| naive.and_utc())
}

fn parse_cell(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct WideCsv {
    pub rows: Vec<WideRow>,
    pub skipped_rows: usize,
}

/// Reads a wide table: one timestamp column plus one column per variable.
///
/// Rows whose timestamp does not parse are counted and skipped. Cells that are
/// empty, non-numeric or non-finite become nulls.
pub fn read_wide_rows<R: io::Read>(reader: R, datetime_column: &str) -> Result<WideCsv> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let headers = csv_reader.headers()?.clone();
    let ts_index = headers
        .iter()
        .position(|h| h == datetime_column)
        .with_context(|| format!("missing datetime column {datetime_column:?}"))?;

    let mut out = WideCsv::default();
    for (line, record) in csv_reader.records().enumerate() {
        let record = record?;
        let Some(timestamp) = record.get(ts_index).and_then(parse_timestamp) else {
            tracing::debug!(line = line + 2, "skipping row with unparseable timestamp");
            out.skipped_rows += 1;
            continue;
        };
        let mut row = WideRow::new(timestamp);
        for (index, header) in headers.iter().enumerate() {
            if index == ts_index || header.is_empty() {
                continue;
            }
            let value = record.get(index).and_then(parse_cell);
            row.values.insert(header.to_string(), value);
        }
        out.rows.push(row);
    }
    Ok(out)
}

/// The file stem, used as the provenance of every imported event.
pub fn source_label(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub files: usize,
    pub rows: usize,
    pub skipped_rows: usize,
    pub events: u64,
}

pub async fn import_files(
    store: &PgStore,
    files: &[PathBuf],
    datetime_column: &str,
) -> Result<ImportReport> {
    let mut report = ImportReport::default();
    for path in files {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let table = read_wide_rows(file, datetime_column)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let source = source_label(path);
        let events = shape::narrow(&table.rows, datetime_column, Some(&source));
        let inserted = store
            .insert_events(&events)
            .await
            .with_context(|| format!("failed to insert events from {}", path.display()))?;

        tracing::info!(
            file = %path.display(),
            source = %source,
            rows = table.rows.len(),
            skipped_rows = table.skipped_rows,
            events = inserted,
            "imported wide csv"
        );
        report.files += 1;
        report.rows += table.rows.len();
        report.skipped_rows += table.skipped_rows;
        report.events += inserted;
    }
    Ok(report)
}
