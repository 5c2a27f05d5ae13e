//! Schema Manager: drops and recreates the star-schema tables.
//!
//! All DROPs run before any CREATE, in [`StarTable::ALL`] order. A failing
//! statement aborts the run; nothing is retried.

use crate::schema::{StarTable, TableDdl, ddl_statements};
use async_trait::async_trait;
use common::{Error, Result};
use tracing::info;

/// The analytical store the DDL runs against.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Removes every object stored beneath `location`, returning the count.
    async fn purge_location(&self, location: &str) -> Result<usize>;
}

pub struct SchemaManager<'a> {
    warehouse: &'a dyn Warehouse,
    statements: Vec<TableDdl>,
    purge: bool,
}

impl<'a> SchemaManager<'a> {
    pub fn new(warehouse: &'a dyn Warehouse, output_root: &str) -> Self {
        Self {
            warehouse,
            statements: ddl_statements(output_root),
            purge: true,
        }
    }

    /// Keep existing table contents on storage; only the catalog is rebuilt.
    pub fn with_purge(mut self, purge: bool) -> Self {
        self.purge = purge;
        self
    }

    pub async fn drop_tables(&self) -> Result<()> {
        for ddl in &self.statements {
            info!(table = %ddl.table, "Dropping table");
            self.run(ddl.table, &ddl.drop).await?;
        }
        Ok(())
    }

    pub async fn create_tables(&self) -> Result<Vec<StarTable>> {
        let mut created = Vec::with_capacity(self.statements.len());
        for ddl in &self.statements {
            info!(table = %ddl.table, location = %ddl.location, "Creating table");
            self.run(ddl.table, &ddl.create).await?;
            created.push(ddl.table);
        }
        Ok(created)
    }

    /// Full refresh of the schema: drop, purge, create.
    pub async fn recreate_tables(&self) -> Result<Vec<StarTable>> {
        self.drop_tables().await?;

        if self.purge {
            for ddl in &self.statements {
                let removed = self.warehouse.purge_location(&ddl.location).await?;
                info!(table = %ddl.table, removed, "Cleared table storage");
            }
        }

        let created = self.create_tables().await?;
        info!(tables = created.len(), "Star schema recreated");
        Ok(created)
    }

    async fn run(&self, table: StarTable, sql: &str) -> Result<()> {
        self.warehouse
            .execute(sql)
            .await
            .map_err(|e| Error::schema(table.as_str(), sql, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingWarehouse {
        log: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl RecordingWarehouse {
        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Warehouse for RecordingWarehouse {
        async fn execute(&self, sql: &str) -> Result<()> {
            if self.fail_on.is_some_and(|needle| sql.contains(needle)) {
                return Err(Error::Other("permission denied".to_string()));
            }
            self.log.lock().unwrap().push(sql.to_string());
            Ok(())
        }

        async fn purge_location(&self, location: &str) -> Result<usize> {
            self.log.lock().unwrap().push(format!("PURGE {}", location));
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_drops_precede_creates_in_fixed_order() {
        let warehouse = RecordingWarehouse::default();
        let created = SchemaManager::new(&warehouse, "s3://lake")
            .recreate_tables()
            .await
            .unwrap();
        assert_eq!(created, StarTable::ALL.to_vec());

        let log = warehouse.entries();
        assert_eq!(log.len(), 15);
        for (i, table) in StarTable::ALL.iter().enumerate() {
            assert_eq!(log[i], format!("DROP TABLE IF EXISTS \"{}\"", table));
            assert_eq!(log[5 + i], format!("PURGE s3://lake/{}/", table));
            assert!(log[10 + i].starts_with(&format!("CREATE EXTERNAL TABLE \"{}\"", table)));
        }
    }

    #[tokio::test]
    async fn test_without_purge_storage_is_untouched() {
        let warehouse = RecordingWarehouse::default();
        SchemaManager::new(&warehouse, "/tmp/lake")
            .with_purge(false)
            .recreate_tables()
            .await
            .unwrap();
        assert!(warehouse.entries().iter().all(|entry| !entry.starts_with("PURGE")));
    }

    #[tokio::test]
    async fn test_failed_create_aborts_run() {
        let warehouse = RecordingWarehouse {
            fail_on: Some("CREATE EXTERNAL TABLE \"songs\""),
            ..Default::default()
        };
        let err = SchemaManager::new(&warehouse, "s3://lake")
            .recreate_tables()
            .await
            .unwrap_err();

        match err {
            Error::Schema { table, statement, .. } => {
                assert_eq!(table, "songs");
                assert!(statement.starts_with("CREATE EXTERNAL TABLE \"songs\""));
            }
            other => panic!("unexpected error: {other}"),
        }

        let creates: Vec<_> = warehouse
            .entries()
            .into_iter()
            .filter(|entry| entry.starts_with("CREATE"))
            .collect();
        // songplays and users were created before songs failed; artists and time never ran.
        assert_eq!(creates.len(), 2);
    }
}
