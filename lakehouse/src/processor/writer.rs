use super::LakehouseProcessor;
use super::metadata::{MARKER_DIR, TableMarker, create_parquet_options, marker_file_name};
use crate::schema::StarTable;
use crate::utils::arrow::batches_to_json;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use common::config::join_location;
use common::{Error, Result};
use datafusion::dataframe::{DataFrame, DataFrameWriteOptions};
use datafusion::error::Result as DFResult;
use datafusion::prelude::{cast, ident};
use serde::Serialize;
use tracing::{Level, debug, info};

const SAMPLE_ROWS: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct TableWriteReport {
    pub table: StarTable,
    pub location: String,
    pub row_count: usize,
    pub written: bool,
}

/// Writes derived tables as partitioned Parquet beneath the output root.
pub struct TableWriter<'a> {
    processor: &'a LakehouseProcessor,
    output_root: String,
    run_id: String,
    write_output: bool,
    purge_output: bool,
}

impl<'a> TableWriter<'a> {
    pub fn new(processor: &'a LakehouseProcessor, output_root: &str, run_id: &str) -> Self {
        Self {
            processor,
            output_root: output_root.to_string(),
            run_id: run_id.to_string(),
            write_output: true,
            purge_output: true,
        }
    }

    /// With `false` the writer still derives and counts every table, but stores nothing.
    pub fn with_write_output(mut self, write_output: bool) -> Self {
        self.write_output = write_output;
        self
    }

    pub fn with_purge_output(mut self, purge_output: bool) -> Self {
        self.purge_output = purge_output;
        self
    }

    pub fn location(&self, table: StarTable) -> String {
        join_location(&self.output_root, table.as_str())
    }

    pub fn marker_location(&self) -> String {
        join_location(&self.output_root, MARKER_DIR)
    }

    pub async fn write_table(&self, table: StarTable, df: DataFrame) -> Result<TableWriteReport> {
        let df = conform_to_schema(table, df)?;
        let batches: Vec<RecordBatch> = df.collect().await?;
        let row_count: usize = batches.iter().map(|batch| batch.num_rows()).sum();
        let location = self.location(table);

        if !self.write_output {
            info!(%table, rows = row_count, "Dry run: table derived but not written");
            if tracing::enabled!(Level::DEBUG) {
                log_sample(table, &batches)?;
            }
            return Ok(TableWriteReport {
                table,
                location,
                row_count,
                written: false,
            });
        }

        let storage = self.processor.resolve_location(&location).await?;
        if self.purge_output {
            storage.purge().await?;
        }

        if row_count > 0 {
            let partition_by = table
                .partition_columns()
                .iter()
                .map(|column| column.to_string())
                .collect::<Vec<_>>();

            info!(%table, rows = row_count, %location, ?partition_by, "Writing table");
            self.processor
                .session_context()
                .read_batches(batches)
                .and_then(|df| stringify_partitions(table, df))?
                .write_parquet(
                    &location,
                    DataFrameWriteOptions::new().with_partition_by(partition_by),
                    Some(create_parquet_options(table, &self.run_id)),
                )
                .await?;
        } else {
            info!(%table, "No rows derived; writing marker only");
        }

        let marker = TableMarker::new(table, &self.run_id, &location, row_count as u64);
        self.processor
            .resolve_location(&self.marker_location())
            .await?
            .put_json(&marker_file_name(table), &marker)
            .await?;

        Ok(TableWriteReport {
            table,
            location,
            row_count,
            written: true,
        })
    }
}

fn log_sample(table: StarTable, batches: &[RecordBatch]) -> Result<()> {
    let sample = batches
        .iter()
        .find(|batch| batch.num_rows() > 0)
        .map(|batch| batch.slice(0, batch.num_rows().min(SAMPLE_ROWS)));

    if let Some(sample) = sample {
        let rows = batches_to_json(&[sample])?;
        debug!(%table, sample = %serde_json::Value::Array(rows), "Sample rows");
    }
    Ok(())
}

/// Partition values become directory names; the catalog re-types them on read.
fn stringify_partitions(table: StarTable, df: DataFrame) -> DFResult<DataFrame> {
    let partitions = table.partition_columns();
    let exprs = table
        .column_names()
        .into_iter()
        .map(|name| {
            if partitions.contains(&name) {
                cast(ident(name), DataType::Utf8).alias(name)
            } else {
                ident(name)
            }
        })
        .collect::<Vec<_>>();
    df.select(exprs)
}

fn types_compatible(expected: &DataType, found: &DataType) -> bool {
    match (expected, found) {
        (DataType::Utf8, DataType::Utf8View | DataType::LargeUtf8) => true,
        (DataType::Timestamp(expected_unit, _), DataType::Timestamp(found_unit, _)) => {
            expected_unit == found_unit
        }
        (expected, found) => expected == found,
    }
}

/// Checks a derived frame against the table schema and projects it into
/// column order with the exact declared types.
pub fn conform_to_schema(table: StarTable, df: DataFrame) -> Result<DataFrame> {
    let mut exprs = Vec::with_capacity(table.schema().fields().len());

    for expected in table.schema().fields() {
        let found = df
            .schema()
            .field_with_unqualified_name(expected.name())
            .map_err(|_| {
                Error::SchemaMismatch(format!(
                    "Missing column {} in derived table {}",
                    expected.name(),
                    table
                ))
            })?;

        if !types_compatible(expected.data_type(), found.data_type()) {
            return Err(Error::SchemaMismatch(format!(
                "Type mismatch for {}.{}. Expected: {:?}, Found: {:?}",
                table,
                expected.name(),
                expected.data_type(),
                found.data_type()
            )));
        }

        exprs.push(cast(ident(expected.name()), expected.data_type().clone()).alias(expected.name()));
    }

    Ok(df.select(exprs)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::TableMarker;
    use crate::warehouse::SchemaManager;
    use common::config::StorageSettings;

    fn local_processor() -> LakehouseProcessor {
        LakehouseProcessor::new(&StorageSettings::default(), Some(2))
    }

    async fn users_frame(processor: &LakehouseProcessor) -> DataFrame {
        processor
            .execute_sql(
                "SELECT * FROM (VALUES \
                    ('free', 'F', 'Lily', 'Koch', CAST(15 AS INT)), \
                    ('paid', 'M', 'Ryan', 'Smith', CAST(26 AS INT))) \
                 AS t(level, gender, first_name, last_name, user_id)",
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_conform_reorders_columns() {
        let processor = local_processor();
        let df = conform_to_schema(StarTable::Users, users_frame(&processor).await).unwrap();
        let names: Vec<_> = df.schema().fields().iter().map(|f| f.name().clone()).collect();
        assert_eq!(names, StarTable::Users.column_names());
    }

    #[tokio::test]
    async fn test_conform_rejects_missing_and_mistyped_columns() {
        let processor = local_processor();
        let missing = processor
            .execute_sql("SELECT 'S1' AS song_id, 'X' AS title")
            .await
            .unwrap();
        assert!(matches!(
            conform_to_schema(StarTable::Songs, missing),
            Err(Error::SchemaMismatch(_))
        ));

        let mistyped = processor
            .execute_sql("SELECT 'seven' AS user_id, 'a' AS first_name, 'b' AS last_name, 'F' AS gender, 'free' AS level")
            .await
            .unwrap();
        assert!(matches!(
            conform_to_schema(StarTable::Users, mistyped),
            Err(Error::SchemaMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_dry_run_counts_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let processor = local_processor();
        let writer = TableWriter::new(&processor, &dir.path().display().to_string(), "run-1")
            .with_write_output(false);

        let report = writer
            .write_table(StarTable::Users, users_frame(&processor).await)
            .await
            .unwrap();
        assert_eq!(report.row_count, 2);
        assert!(!report.written);
        assert!(!dir.path().join("users").exists());
    }

    #[tokio::test]
    async fn test_write_table_is_readable_through_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().display().to_string();
        let processor = local_processor();
        SchemaManager::new(&processor, &root)
            .recreate_tables()
            .await
            .unwrap();

        let writer = TableWriter::new(&processor, &root, "run-1");
        let report = writer
            .write_table(StarTable::Users, users_frame(&processor).await)
            .await
            .unwrap();
        assert!(report.written);
        assert_eq!(report.row_count, 2);

        let marker_path = dir
            .path()
            .join(MARKER_DIR)
            .join(marker_file_name(StarTable::Users));
        let marker_body = std::fs::read(marker_path).unwrap();
        let marker: TableMarker = serde_json::from_slice(&marker_body).unwrap();
        assert_eq!(marker.row_count, 2);
        assert_eq!(marker.run_id, "run-1");

        assert_eq!(processor.table_row_count("users").await.unwrap(), 2);

        // A rewrite replaces rather than appends.
        writer
            .write_table(StarTable::Users, users_frame(&processor).await)
            .await
            .unwrap();
        assert_eq!(processor.table_row_count("users").await.unwrap(), 2);
    }
}
