//! The entry point a pipeline orchestrator talks to.

use crate::config::FerryConfig;
use crate::error::FerryResult;
use crate::introspect::{ColumnMetadata, SchemaIntrospector};
use crate::ledger::CostLedger;
use crate::loader::BatchLoader;
use crate::materializer::Materializer;
use crate::runner::QueryRunner;
use crate::source::{DataFusionConnector, SourceConnector};
use crate::table::ColumnarTable;
use crate::warehouse::{
    BigQueryWarehouse, LocalWarehouse, QueryParameter, QueryRows, SchemaField, TableId, Warehouse,
    WriteDisposition,
};
use ferry_common::{BucketStores, CommonError, ObjectStoreStager, Stager};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// `FerryContext` owns one cost ledger and the components that share it.
///
/// Cloning is cheap and every clone charges the same ledger; two contexts
/// built separately keep separate totals.
#[derive(Debug, Clone)]
pub struct FerryContext {
    config: FerryConfig,
    ledger: Arc<CostLedger>,
    stager: Arc<dyn Stager>,
    runner: QueryRunner,
    materializer: Materializer,
    loader: BatchLoader,
}

impl FerryContext {
    /// Assemble a context from explicit components.
    pub fn new(
        config: FerryConfig,
        warehouse: Arc<dyn Warehouse>,
        stager: Arc<dyn Stager>,
        connector: Arc<dyn SourceConnector>,
    ) -> Self {
        let ledger = Arc::new(CostLedger::new());
        let runner = QueryRunner::new(warehouse.clone(), ledger.clone(), config.pricing.clone());
        let materializer = Materializer::from_config(connector, &config.retry);
        let loader = BatchLoader::new(warehouse);
        Self {
            config,
            ledger,
            stager,
            runner,
            materializer,
            loader,
        }
    }

    /// Context backed by the in-process DataFusion warehouse, staging into
    /// the configured storage backend.
    pub fn local(config: FerryConfig) -> FerryResult<Self> {
        config.validate()?;
        let stores = Arc::new(BucketStores::new(config.storage.clone()));
        let warehouse = Arc::new(LocalWarehouse::new(stores.clone()));
        let stager = Arc::new(ObjectStoreStager::new(stores));
        info!(location = %config.location, storage = ?config.storage, "Created local context");
        Ok(Self::new(
            config,
            warehouse,
            stager,
            Arc::new(DataFusionConnector::new()),
        ))
    }

    /// Context running against BigQuery in `project`.
    pub fn bigquery(
        config: FerryConfig,
        project: impl Into<String>,
        access_token: impl Into<String>,
        connector: Arc<dyn SourceConnector>,
    ) -> FerryResult<Self> {
        config.validate()?;
        let stores = Arc::new(BucketStores::new(config.storage.clone()));
        let warehouse = Arc::new(BigQueryWarehouse::new(
            project,
            config.location.clone(),
            access_token,
            &config.bigquery,
        ));
        let stager = Arc::new(ObjectStoreStager::new(stores));
        info!(warehouse = ?warehouse, "Created BigQuery context");
        Ok(Self::new(config, warehouse, stager, connector))
    }

    pub fn config(&self) -> &FerryConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        self.runner.warehouse()
    }

    pub fn stager(&self) -> &Arc<dyn Stager> {
        &self.stager
    }

    pub fn runner(&self) -> &QueryRunner {
        &self.runner
    }

    pub fn introspector(&self) -> SchemaIntrospector {
        SchemaIntrospector::new(self.runner.clone())
    }

    /// Accumulated warehouse query cost of this context.
    pub fn total_cost(&self) -> f64 {
        self.ledger.total_cost()
    }

    pub async fn run_query(
        &self,
        sql: &str,
        params: &[QueryParameter],
    ) -> FerryResult<(QueryRows, f64)> {
        Ok(self.runner.run_query(sql, params).await?)
    }

    pub async fn run_query_rows(
        &self,
        sql: &str,
        params: &[QueryParameter],
    ) -> FerryResult<QueryRows> {
        Ok(self.runner.run_query_rows(sql, params).await?)
    }

    /// Read a source query into memory; returns the table and its size in
    /// bytes.
    pub async fn load_local_query(
        &self,
        connection: &str,
        sql: &str,
    ) -> FerryResult<(ColumnarTable, usize)> {
        Ok(self.materializer.materialize(connection, sql).await?)
    }

    /// Write `table` to a Parquet file at `path` off the async runtime.
    pub async fn write_staging_file(
        &self,
        table: &ColumnarTable,
        path: impl AsRef<Path>,
    ) -> FerryResult<PathBuf> {
        let table = table.clone();
        let path = path.as_ref().to_path_buf();
        let written = tokio::task::spawn_blocking(move || table.write_parquet(path))
            .await
            .map_err(|e| CommonError::internal_error_with_source("Parquet writer task failed", e))??;
        Ok(written)
    }

    pub async fn stage_file(&self, local_file: &Path, bucket_uri: &str) -> FerryResult<String> {
        Ok(self.stager.upload(local_file, bucket_uri).await?)
    }

    pub async fn batch_load(
        &self,
        staged_uri: &str,
        target: &TableId,
        disposition: WriteDisposition,
        schema: Option<Vec<SchemaField>>,
    ) -> FerryResult<u64> {
        Ok(self
            .loader
            .batch_load(staged_uri, target, disposition, schema)
            .await?)
    }

    /// Remove every staged object under `bucket_uri`.
    pub async fn delete_from_bucket(&self, bucket_uri: &str) -> FerryResult<usize> {
        Ok(self.stager.delete_prefix(bucket_uri).await?)
    }

    /// Drop `target`; a table that does not exist is not an error.
    pub async fn delete_table(&self, target: &TableId) -> FerryResult<()> {
        Ok(self.warehouse().delete_table(target, true).await?)
    }

    pub async fn set_clustering_fields(
        &self,
        target: &TableId,
        fields: &[String],
    ) -> FerryResult<()> {
        Ok(self.warehouse().set_clustering_fields(target, fields).await?)
    }

    pub async fn list_tables(&self, project: &str, dataset: &str) -> FerryResult<Vec<String>> {
        Ok(self.introspector().list_tables(project, dataset).await?)
    }

    pub async fn list_columns(
        &self,
        project: &str,
        dataset: &str,
        table: &str,
    ) -> FerryResult<Vec<ColumnMetadata>> {
        Ok(self
            .introspector()
            .list_columns(project, dataset, table)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::error::{FerryError, WarehouseError};

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = FerryConfig::default().with_retry(RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        });
        assert!(matches!(
            FerryContext::local(config),
            Err(FerryError::Storage(CommonError::ConfigurationError { .. }))
        ));
    }

    #[tokio::test]
    async fn test_clones_share_one_ledger() {
        let context = FerryContext::local(FerryConfig::default()).expect("Failed to create context");
        let clone = context.clone();
        context.run_query("SELECT 1 AS x", &[]).await.expect("query");
        clone.run_query("SELECT 2 AS y", &[]).await.expect("query");
        assert_eq!(context.total_cost(), clone.total_cost());
        assert_eq!(context.ledger().entries(), 2);

        let separate = FerryContext::local(FerryConfig::default()).expect("context");
        assert_eq!(separate.total_cost(), 0.0);
    }

    #[tokio::test]
    async fn test_delete_missing_table_is_ok() {
        let context = FerryContext::local(FerryConfig::default()).expect("context");
        context
            .delete_table(&TableId::new("proj", "ds", "never"))
            .await
            .expect("missing table tolerated");
    }

    #[tokio::test]
    async fn test_clustering_on_missing_table_fails() {
        let context = FerryContext::local(FerryConfig::default()).expect("context");
        let err = context
            .set_clustering_fields(&TableId::new("proj", "ds", "never"), &["x".to_string()])
            .await
            .expect_err("no such table");
        assert!(matches!(err, FerryError::Warehouse(WarehouseError::NotFound(_))));
    }
}
