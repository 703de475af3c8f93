//! Ferry Core - staging and query execution for a cloud data warehouse
//!
//! Query results from a source database are materialized into Arrow
//! tables, written to Parquet, staged in object storage and batch-loaded
//! into warehouse tables. Every warehouse query is charged to a cost ledger.

pub mod config;
pub mod context;
pub mod error;
pub mod introspect;
pub mod ledger;
pub mod loader;
pub mod logging;
pub mod materializer;
pub mod retry;
pub mod runner;
pub mod source;
pub mod table;
pub mod warehouse;

pub use config::{BigQueryConfig, FerryConfig, PricingConfig, RetryConfig};
pub use context::FerryContext;
pub use error::{
    FerryError, FerryResult, SourceError, SourceResult, WarehouseError, WarehouseResult,
};
pub use introspect::{ColumnMetadata, SchemaIntrospector};
pub use ledger::{CostLedger, billed_cost};
pub use loader::BatchLoader;
pub use materializer::Materializer;
pub use retry::{ExponentialBackoff, RetryPolicy};
pub use runner::QueryRunner;
pub use source::{DataFusionConnector, SourceConnector};
pub use table::ColumnarTable;
pub use warehouse::{
    BigQueryWarehouse, FieldMode, FieldType, LoadJobConfig, LocalWarehouse, ParameterValue,
    QueryParameter, QueryRows, Row, SchemaField, TableId, Warehouse, WriteDisposition,
};
