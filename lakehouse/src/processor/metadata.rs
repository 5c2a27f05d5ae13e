use crate::schema::StarTable;
use chrono::{DateTime, Utc};
use datafusion::common::config::TableParquetOptions;
use serde::{Deserialize, Serialize};

/// Directory beneath the output root holding one completion marker per table.
///
/// Markers stay outside the table locations: an unpartitioned listing table
/// reads every object under its location as Parquet.
pub const MARKER_DIR: &str = "_markers";

pub const CREATED_BY: &str = concat!("sparkify-etl ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TableMarker {
    pub table: String,
    pub run_id: String,
    pub location: String,
    pub row_count: u64,
    pub partition_columns: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl TableMarker {
    pub fn new(table: StarTable, run_id: &str, location: &str, row_count: u64) -> Self {
        Self {
            table: table.as_str().to_string(),
            run_id: run_id.to_string(),
            location: location.to_string(),
            row_count,
            partition_columns: table
                .partition_columns()
                .iter()
                .map(|column| column.to_string())
                .collect(),
            created_at: Utc::now(),
        }
    }
}

pub fn marker_file_name(table: StarTable) -> String {
    format!("{}_SUCCESS.json", table.as_str())
}

pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn table_key_value_metadata(table: StarTable, run_id: &str) -> Vec<(String, String)> {
    vec![
        ("table".to_string(), table.as_str().to_string()),
        ("run_id".to_string(), run_id.to_string()),
        ("created_by".to_string(), CREATED_BY.to_string()),
    ]
}

pub fn create_parquet_options(table: StarTable, run_id: &str) -> TableParquetOptions {
    let mut options = TableParquetOptions::new();
    for (key, value) in table_key_value_metadata(table, run_id) {
        options.key_value_metadata.insert(key, Some(value));
    }
    options
}
