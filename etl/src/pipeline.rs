//! Orchestrator: schema refresh, then the song loader, then the log loader.

use crate::extract::ExtractStats;
use crate::logs::LogLoader;
use crate::songs::SongLoader;
use common::config::Settings;
use common::{Error, Result};
use lakehouse::processor::metadata::new_run_id;
use lakehouse::{LakehouseProcessor, SchemaManager, StarTable, TableWriteReport, TableWriter};
use serde::Serialize;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub songs: ExtractStats,
    pub events: ExtractStats,
    pub next_song_events: usize,
    pub tables: Vec<TableWriteReport>,
}

impl RunSummary {
    pub fn table(&self, table: StarTable) -> Option<&TableWriteReport> {
        self.tables.iter().find(|report| report.table == table)
    }
}

/// Drops and recreates the star-schema tables.
pub async fn run_create_tables(settings: &Settings) -> Result<Vec<StarTable>> {
    let processor = LakehouseProcessor::from_settings(settings);
    create_tables(&processor, settings).await
}

async fn create_tables(processor: &LakehouseProcessor, settings: &Settings) -> Result<Vec<StarTable>> {
    let pipeline = &settings.pipeline;
    SchemaManager::new(processor, &pipeline.output_root)
        .with_purge(pipeline.write_output && pipeline.purge_output)
        .recreate_tables()
        .await
}

/// Loads settings from `config_path` and runs the full pipeline.
pub async fn run_etl_pipeline(config_path: &str) -> Result<RunSummary> {
    let settings = Settings::new(config_path)?;
    run_etl(&settings).await
}

pub async fn run_etl(settings: &Settings) -> Result<RunSummary> {
    let started = Instant::now();
    let pipeline = &settings.pipeline;
    let run_id = new_run_id();
    info!(
        %run_id,
        input_root = %pipeline.input_root,
        output_root = %pipeline.output_root,
        write_output = pipeline.write_output,
        "Starting ETL run"
    );

    let processor = LakehouseProcessor::from_settings(settings);
    create_tables(&processor, settings).await?;

    let writer = TableWriter::new(&processor, &pipeline.output_root, &run_id)
        .with_write_output(pipeline.write_output)
        .with_purge_output(pipeline.purge_output);

    let songs = SongLoader::new(&processor, &writer, &pipeline.song_data_location())
        .load()
        .await?;
    let logs = LogLoader::new(&processor, &writer, &pipeline.log_data_location())
        .load()
        .await?;

    let mut tables = songs.tables;
    tables.extend(logs.tables);

    if pipeline.write_output && pipeline.purge_output {
        verify_tables(&processor, &tables).await?;
    } else if !pipeline.write_output {
        warn!("Dry run: no tables were written");
    }

    info!(
        %run_id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "ETL run complete"
    );

    Ok(RunSummary {
        run_id,
        songs: songs.extract,
        events: logs.extract,
        next_song_events: logs.next_song_events,
        tables,
    })
}

/// Reads every written table back through the catalog and checks its row
/// count and that no stored row lacks its key.
async fn verify_tables(processor: &LakehouseProcessor, tables: &[TableWriteReport]) -> Result<()> {
    for report in tables.iter().filter(|report| report.written) {
        let table = report.table;
        let stored = processor.table_row_count(table.as_str()).await?;
        if stored != report.row_count {
            return Err(Error::Storage(format!(
                "Table {} holds {} rows at {}, expected {}",
                table, stored, report.location, report.row_count
            )));
        }

        let missing_keys = processor
            .null_count(table.as_str(), table.key_column())
            .await?;
        if missing_keys > 0 {
            return Err(Error::Storage(format!(
                "Table {} holds {} rows without {}",
                table,
                missing_keys,
                table.key_column()
            )));
        }
        info!(%table, rows = stored, "Verified table");
    }
    Ok(())
}
