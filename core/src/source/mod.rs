//! Source database connectors.
//!
//! A connector turns an opaque connection string and a query into a
//! [`ColumnarTable`]. The materializer only sees this trait, so any engine
//! can be plugged in by implementing it.

pub mod datafusion;

pub use self::datafusion::DataFusionConnector;

use crate::error::SourceResult;
use crate::table::ColumnarTable;
use async_trait::async_trait;
use std::fmt::Debug;

#[async_trait]
pub trait SourceConnector: Send + Sync + Debug {
    /// Run `sql` against the database named by `connection` and return the
    /// complete result.
    async fn read_sql(&self, connection: &str, sql: &str) -> SourceResult<ColumnarTable>;
}
