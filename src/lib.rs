pub mod backfill;
pub mod cli;
pub mod config;
pub mod error;
pub mod import;
pub mod inference;
pub mod model_client;
pub mod records;
pub mod sanitize;
pub mod shape;
pub mod store;
pub mod watermark;
pub mod worker;
