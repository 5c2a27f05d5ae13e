pub mod metadata;
pub mod writer;

pub use metadata::{MARKER_DIR, TableMarker, marker_file_name};
pub use writer::{TableWriteReport, TableWriter};

use crate::storage::objects::normalize_location;
use crate::storage::{S3Config, S3Manager, StorageLocation};
use crate::warehouse::Warehouse;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use common::config::{Settings, StorageSettings};
use common::{Error, Result};
use dashmap::DashSet;
use datafusion::dataframe::DataFrame;
use datafusion::datasource::MemTable;
use datafusion::datasource::listing::ListingTableUrl;
use datafusion::execution::context::{SessionConfig, SessionContext};
use datafusion::prelude::ident;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// The processing context shared by every stage of a run.
///
/// Owns the DataFusion session (engine and table catalog) and the S3
/// connections. It is created once per invocation and passed explicitly.
pub struct LakehouseProcessor {
    ctx: SessionContext,
    s3_manager: Arc<S3Manager>,
    verify_buckets: bool,
    registered_buckets: DashSet<String>,
}

impl LakehouseProcessor {
    pub fn new(storage: &StorageSettings, target_partitions: Option<usize>) -> Self {
        let mut config = SessionConfig::new().with_information_schema(true);
        if let Some(partitions) = target_partitions {
            config = config.with_target_partitions(partitions);
        }

        Self {
            ctx: SessionContext::new_with_config(config),
            s3_manager: Arc::new(S3Manager::new(S3Config::from(storage))),
            verify_buckets: storage.verify_buckets,
            registered_buckets: DashSet::new(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.storage, settings.pipeline.target_partitions)
    }

    // Get the current session context
    pub fn session_context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Resolves a root-relative location (local path, `file://`, `s3://`, `s3a://`)
    /// to the object store serving it, registering S3 buckets on first use.
    pub async fn resolve_location(&self, location: &str) -> Result<StorageLocation> {
        let location = normalize_location(location);

        if location.starts_with("s3://") {
            let parsed = Url::parse(&location)?;
            let bucket = parsed.host_str().ok_or_else(|| {
                Error::InvalidInput(format!("S3 location '{}' has no bucket", location))
            })?;
            self.register_s3_bucket(bucket).await?;
        }

        let table_url = ListingTableUrl::parse(&location)?;
        let store = self.ctx.runtime_env().object_store(table_url.object_store())?;

        Ok(StorageLocation {
            url: location,
            store,
            prefix: table_url.prefix().clone(),
        })
    }

    async fn register_s3_bucket(&self, bucket: &str) -> Result<()> {
        if self.registered_buckets.contains(bucket) {
            return Ok(());
        }

        self.s3_manager.register_object_store(&self.ctx, bucket).await?;
        if self.verify_buckets {
            self.s3_manager.verify_bucket_exists(bucket).await?;
        }

        self.registered_buckets.insert(bucket.to_string());
        Ok(())
    }

    // Execute SQL query
    pub async fn execute_sql(&self, sql: &str) -> Result<DataFrame> {
        self.ctx.sql(sql).await.map_err(|e| e.into())
    }

    /// Registers in-memory batches as a queryable table, replacing any previous one.
    pub fn register_batches(
        &self,
        table_name: &str,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<()> {
        let table = MemTable::try_new(schema, vec![batches])?;
        self.ctx.deregister_table(table_name)?;
        self.ctx.register_table(table_name, Arc::new(table))?;
        debug!(table = table_name, "Registered in-memory table");
        Ok(())
    }

    /// Registers a DataFrame's plan under `view_name`, replacing any previous one.
    pub fn register_view(&self, view_name: &str, df: DataFrame) -> Result<()> {
        self.ctx.deregister_table(view_name)?;
        self.ctx.register_table(view_name, df.into_view())?;
        debug!(view = view_name, "Registered view");
        Ok(())
    }

    pub async fn table_row_count(&self, table_name: &str) -> Result<usize> {
        let df = self.ctx.table(table_name).await?;
        Ok(df.count().await?)
    }

    /// Counts the rows of `table_name` whose `column` is null.
    pub async fn null_count(&self, table_name: &str, column: &str) -> Result<usize> {
        let df = self
            .ctx
            .table(table_name)
            .await?
            .filter(ident(column).is_null())?;
        Ok(df.count().await?)
    }
}

#[async_trait]
impl Warehouse for LakehouseProcessor {
    async fn execute(&self, sql: &str) -> Result<()> {
        debug!(sql, "Executing statement");
        self.ctx.sql(sql).await?.collect().await?;
        Ok(())
    }

    async fn purge_location(&self, location: &str) -> Result<usize> {
        self.resolve_location(location).await?.purge().await
    }
}
