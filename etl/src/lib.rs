pub mod extract;
pub mod logs;
pub mod pipeline;
pub mod songs;

pub use extract::ExtractStats;
pub use pipeline::{RunSummary, run_create_tables, run_etl, run_etl_pipeline};
