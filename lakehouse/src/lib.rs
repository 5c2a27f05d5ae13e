pub mod processor;
pub mod schema;
pub mod storage;
pub mod utils;
pub mod warehouse;

pub use processor::{LakehouseProcessor, TableWriteReport, TableWriter};
pub use schema::StarTable;
pub use warehouse::{SchemaManager, Warehouse};
