//! Source connector running queries on DataFusion over local files.
//!
//! The connection string is either `memory://`, which gives an engine with
//! no tables, or a directory (optionally as a `file://` URL). Every
//! `.parquet` and `.csv` file directly inside the directory is registered
//! as a table named after the file stem. SQL that fails to plan is reported
//! as [`SourceError::Query`].

use super::SourceConnector;
use crate::error::{SourceError, SourceResult};
use crate::table::ColumnarTable;
use arrow::datatypes::SchemaRef;
use async_trait::async_trait;
use datafusion::execution::context::SessionContext;
use datafusion::prelude::{CsvReadOptions, ParquetReadOptions, SessionConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const MEMORY_CONNECTION: &str = "memory://";

#[derive(Debug, Clone)]
pub struct DataFusionConnector {
    batch_size: usize,
}

impl Default for DataFusionConnector {
    fn default() -> Self {
        Self { batch_size: 8192 }
    }
}

impl DataFusionConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn session(&self) -> SessionContext {
        SessionContext::new_with_config(SessionConfig::new().with_batch_size(self.batch_size))
    }

    fn directory(connection: &str) -> Option<PathBuf> {
        if connection == MEMORY_CONNECTION || connection == "memory" {
            return None;
        }
        let path = connection.strip_prefix("file://").unwrap_or(connection);
        Some(PathBuf::from(path))
    }

    async fn register_directory(&self, ctx: &SessionContext, directory: &Path) -> SourceResult<()> {
        let mut entries = tokio::fs::read_dir(directory).await.map_err(|e| {
            SourceError::Connection(format!("cannot open {}: {}", directory.display(), e))
        })?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SourceError::Connection(format!("cannot list {}: {}", directory.display(), e)))?
        {
            let path = entry.path();
            let (Some(stem), Some(extension)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            let Some(location) = path.to_str() else {
                continue;
            };
            match extension {
                "parquet" => {
                    ctx.register_parquet(stem, location, ParquetReadOptions::default())
                        .await?
                }
                "csv" => ctx.register_csv(stem, location, CsvReadOptions::new()).await?,
                _ => continue,
            }
            debug!(table = stem, file = location, "Registered source table");
        }
        Ok(())
    }
}

#[async_trait]
impl SourceConnector for DataFusionConnector {
    async fn read_sql(&self, connection: &str, sql: &str) -> SourceResult<ColumnarTable> {
        let ctx = self.session();
        if let Some(directory) = Self::directory(connection) {
            self.register_directory(&ctx, &directory).await?;
        }

        let df = ctx
            .sql(sql)
            .await
            .map_err(|e| SourceError::Query(format!("cannot plan query: {}", e)))?;
        let planned: SchemaRef = Arc::new(df.schema().as_arrow().clone());
        let batches = df.collect().await?;
        let schema = batches.first().map(|b| b.schema()).unwrap_or(planned);
        Ok(ColumnarTable::try_new(schema, batches)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_connection_runs_constant_query() {
        let table = DataFusionConnector::new()
            .read_sql("memory://", "SELECT 1 AS x")
            .await
            .expect("Failed to run query");
        assert_eq!(table.num_rows(), 1);
        assert_eq!(table.schema().field(0).name(), "x");
    }

    #[tokio::test]
    async fn test_directory_tables_are_queryable() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        std::fs::write(dir.path().join("person.csv"), "id,name\n1,ann\n2,bob\n3,cy\n")
            .expect("Failed to write csv");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("Failed to write txt");

        let connection = format!("file://{}", dir.path().display());
        let table = DataFusionConnector::new()
            .read_sql(&connection, "SELECT name FROM person WHERE id > 1 ORDER BY id")
            .await
            .expect("Failed to query directory");
        assert_eq!(table.num_rows(), 2);
    }

    #[tokio::test]
    async fn test_missing_directory_is_connection_error() {
        let err = DataFusionConnector::new()
            .read_sql("/definitely/not/a/dir", "SELECT 1")
            .await
            .expect_err("directory does not exist");
        assert!(matches!(err, SourceError::Connection(_)));
        assert!(!err.is_credential_error());
    }

    #[tokio::test]
    async fn test_unplannable_sql_is_query_error() {
        let err = DataFusionConnector::new()
            .read_sql("memory://", "SELECT * FROM missing")
            .await
            .expect_err("unknown table");
        assert!(matches!(err, SourceError::Query(ref msg) if msg.contains("missing")));
        assert!(!err.is_credential_error());
    }
}
