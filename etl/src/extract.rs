//! JSON-lines extraction into in-memory staging tables.

use arrow::datatypes::SchemaRef;
use arrow::json::ReaderBuilder;
use arrow::record_batch::RecordBatch;
use common::Result;
use futures::{StreamExt, TryStreamExt};
use lakehouse::LakehouseProcessor;
use lakehouse::storage::ListOptions;
use serde::Serialize;
use tracing::{debug, info, warn};

const JSON_EXTENSIONS: &[&str] = &[".json", ".jsonl"];
const CONCURRENT_READS: usize = 8;
const STAGING_BATCH_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtractStats {
    pub files: usize,
    pub lines: usize,
    pub records: usize,
    pub malformed: usize,
}

/// Reads every JSON-lines file beneath `location` and turns each non-blank
/// line into a record with `parse`.
///
/// Files are visited in key order and every line gets a sequence number that
/// grows across files, so a larger `seq` always means a later record. Lines
/// that are not valid UTF-8 or that `parse` rejects are counted as malformed
/// and skipped.
pub async fn extract_json_lines<T, F>(
    processor: &LakehouseProcessor,
    location: &str,
    mut parse: F,
) -> Result<(Vec<T>, ExtractStats)>
where
    F: FnMut(&str, i64) -> Option<T>,
{
    let storage = processor.resolve_location(location).await?;
    let files = storage
        .list_files(&ListOptions::with_extensions(JSON_EXTENSIONS))
        .await?;

    let mut stats = ExtractStats {
        files: files.len(),
        ..Default::default()
    };
    let mut records = Vec::new();
    let mut seq: i64 = 0;

    let storage = &storage;
    let mut contents = futures::stream::iter(files.iter())
        .map(|meta| async move {
            let body = storage.read(&meta.location).await?;
            Ok::<_, common::Error>((meta.location.to_string(), body))
        })
        .buffered(CONCURRENT_READS);

    while let Some((path, body)) = contents.try_next().await? {
        for (line_no, bytes) in body.split(|byte| *byte == b'\n').enumerate() {
            let bytes = bytes.trim_ascii();
            if bytes.is_empty() {
                continue;
            }
            stats.lines += 1;
            seq += 1;

            match std::str::from_utf8(bytes).ok().and_then(|line| parse(line, seq)) {
                Some(record) => records.push(record),
                None => {
                    stats.malformed += 1;
                    debug!(file = %path, line = line_no + 1, "Dropping malformed record");
                }
            }
        }
    }

    stats.records = records.len();
    if stats.malformed > 0 {
        warn!(
            %location,
            files = stats.files,
            records = stats.records,
            malformed = stats.malformed,
            "Extraction dropped malformed records"
        );
    } else {
        info!(%location, files = stats.files, records = stats.records, "Extraction complete");
    }

    Ok((records, stats))
}

/// Serializes records into Arrow batches of `schema`.
pub fn records_to_batches<T: Serialize>(schema: SchemaRef, records: &[T]) -> Result<Vec<RecordBatch>> {
    let mut decoder = ReaderBuilder::new(schema)
        .with_batch_size(STAGING_BATCH_SIZE)
        .build_decoder()?;

    let mut batches = Vec::new();
    for chunk in records.chunks(STAGING_BATCH_SIZE) {
        decoder.serialize(chunk)?;
        if let Some(batch) = decoder.flush()? {
            batches.push(batch);
        }
    }
    Ok(batches)
}

/// Registers `records` as the in-memory table `table_name`, replacing any earlier one.
pub fn stage_records<T: Serialize>(
    processor: &LakehouseProcessor,
    table_name: &str,
    schema: SchemaRef,
    records: &[T],
) -> Result<()> {
    let batches = records_to_batches(schema.clone(), records)?;
    processor.register_batches(table_name, schema, batches)?;
    debug!(table = table_name, rows = records.len(), "Staged records");
    Ok(())
}
