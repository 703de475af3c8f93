//! In-process warehouse on DataFusion.
//!
//! Projects are DataFusion catalogs and datasets are schemas inside them,
//! so `project.dataset.table` resolves the same way it does in BigQuery.
//! Tables are in-memory. Loads read staged Parquet through the same
//! [`BucketStores`] the stager writes to.

use super::{
    JobStatistics, LoadJobConfig, QueryJob, QueryParameter, SqlDialect, TableId, Warehouse,
    WriteDisposition, arrow_schema,
};
use crate::error::{WarehouseError, WarehouseResult};
use crate::table::count_rows;
use arrow::array::{ArrayRef, new_null_array};
use arrow::compute::{CastOptions, cast_with_options};
use arrow::datatypes::{Field, FieldRef, Schema, SchemaRef};
use arrow::record_batch::{RecordBatch, RecordBatchReader};
use async_trait::async_trait;
use datafusion::catalog::{CatalogProvider, MemoryCatalogProvider, MemorySchemaProvider, SchemaProvider};
use datafusion::common::TableReference;
use datafusion::datasource::MemTable;
use datafusion::execution::context::SessionContext;
use datafusion::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use datafusion::prelude::SessionConfig;
use datafusion::scalar::ScalarValue;
use ferry_common::{BucketStores, BucketUri, CommonError};
use futures::StreamExt;
use object_store::path::Path as ObjectPath;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Maximum number of clustering columns a table may declare.
const MAX_CLUSTERING_FIELDS: usize = 4;

pub struct LocalWarehouse {
    ctx: SessionContext,
    stores: Arc<BucketStores>,
    clustering: Mutex<HashMap<TableId, Vec<String>>>,
    /// Serializes read-modify-write cycles on table contents.
    write_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for LocalWarehouse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalWarehouse")
            .field("session_id", &self.ctx.session_id())
            .field("stores", &self.stores)
            .finish_non_exhaustive()
    }
}

impl LocalWarehouse {
    pub fn new(stores: Arc<BucketStores>) -> Self {
        let config = SessionConfig::new().with_information_schema(true);
        Self {
            ctx: SessionContext::new_with_config(config),
            stores,
            clustering: Mutex::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn session_context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn stores(&self) -> &Arc<BucketStores> {
        &self.stores
    }

    /// Create `target`, replacing any table of that name.
    pub async fn create_table(
        &self,
        target: &TableId,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> WarehouseResult<()> {
        let _guard = self.write_lock.lock().await;
        self.replace_table(target, schema, batches)
    }

    /// Schema of `target`, if the table exists.
    pub async fn table_schema(&self, target: &TableId) -> WarehouseResult<Option<SchemaRef>> {
        Ok(self.table_provider(target).await?.map(|table| table.schema()))
    }

    /// Clustering columns last set on `target`.
    pub fn clustering_fields(&self, target: &TableId) -> Option<Vec<String>> {
        self.clustering
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(target)
            .cloned()
    }

    fn table_reference(target: &TableId) -> TableReference {
        TableReference::full(
            target.project.as_str(),
            target.dataset.as_str(),
            target.table.as_str(),
        )
    }

    fn dataset(&self, target: &TableId) -> Option<Arc<dyn SchemaProvider>> {
        self.ctx.catalog(&target.project)?.schema(&target.dataset)
    }

    fn dataset_or_create(&self, target: &TableId) -> WarehouseResult<Arc<dyn SchemaProvider>> {
        let catalog = match self.ctx.catalog(&target.project) {
            Some(catalog) => catalog,
            None => {
                debug!(project = %target.project, "Creating local project");
                let catalog: Arc<dyn CatalogProvider> = Arc::new(MemoryCatalogProvider::new());
                self.ctx.register_catalog(&target.project, catalog.clone());
                catalog
            }
        };
        if let Some(dataset) = catalog.schema(&target.dataset) {
            return Ok(dataset);
        }
        debug!(project = %target.project, dataset = %target.dataset, "Creating local dataset");
        let dataset: Arc<dyn SchemaProvider> = Arc::new(MemorySchemaProvider::new());
        catalog.register_schema(&target.dataset, dataset.clone())?;
        Ok(dataset)
    }

    async fn table_provider(
        &self,
        target: &TableId,
    ) -> WarehouseResult<Option<Arc<dyn datafusion::datasource::TableProvider>>> {
        match self.dataset(target) {
            Some(dataset) => Ok(dataset.table(&target.table).await?),
            None => Ok(None),
        }
    }

    /// Schema and rows of `target`, if it exists.
    async fn snapshot(
        &self,
        target: &TableId,
    ) -> WarehouseResult<Option<(SchemaRef, Vec<RecordBatch>)>> {
        let Some(table) = self.table_provider(target).await? else {
            return Ok(None);
        };
        let schema = table.schema();
        let batches = self
            .ctx
            .table(Self::table_reference(target))
            .await?
            .collect()
            .await?;
        Ok(Some((schema, batches)))
    }

    fn replace_table(
        &self,
        target: &TableId,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> WarehouseResult<()> {
        let dataset = self.dataset_or_create(target)?;
        let table = MemTable::try_new(schema, vec![batches])?;
        dataset.deregister_table(&target.table)?;
        dataset.register_table(target.table.clone(), Arc::new(table))?;
        Ok(())
    }

    /// Staged objects named by `uri`, sorted by key. A `*` in the last path
    /// segment matches any run of characters within that segment.
    async fn resolve_objects(&self, uri: &BucketUri) -> WarehouseResult<Vec<ObjectPath>> {
        let path = uri.path();
        if path.is_empty() {
            return Err(WarehouseError::InvalidArgument(format!(
                "'{}' does not name an object",
                uri
            )));
        }
        let (directory, file_pattern) = match path.rsplit_once('/') {
            Some((directory, file)) => (directory, file),
            None => ("", path),
        };
        let Some((head, tail)) = file_pattern.split_once('*') else {
            return Ok(vec![uri.key().clone()]);
        };
        if tail.contains('*') || directory.contains('*') {
            return Err(WarehouseError::InvalidArgument(format!(
                "'{}' may contain only one wildcard, in its last segment",
                uri
            )));
        }

        let store = self.stores.store(uri.bucket())?;
        let prefix = if directory.is_empty() {
            None
        } else {
            Some(ObjectPath::parse(directory).map_err(|e| {
                CommonError::invalid_uri_error_with_source(format!("bad prefix in {}", uri), e)
            })?)
        };
        let mut matches = Vec::new();
        let mut listing = store.list(prefix.as_ref());
        while let Some(entry) = listing.next().await {
            let meta = entry.map_err(CommonError::from)?;
            let key = meta.location.as_ref();
            let name = if directory.is_empty() {
                key
            } else {
                match key
                    .strip_prefix(directory)
                    .and_then(|rest| rest.strip_prefix('/'))
                {
                    Some(name) => name,
                    None => continue,
                }
            };
            if !name.contains('/')
                && name.len() >= head.len() + tail.len()
                && name.starts_with(head)
                && name.ends_with(tail)
            {
                matches.push(meta.location);
            }
        }
        if matches.is_empty() {
            return Err(WarehouseError::NotFound(format!(
                "no objects match {}",
                uri
            )));
        }
        matches.sort();
        Ok(matches)
    }

    async fn read_staged(&self, uri: &str) -> WarehouseResult<Vec<(SchemaRef, Vec<RecordBatch>)>> {
        let location = BucketUri::parse(uri)?;
        let objects = self.resolve_objects(&location).await?;
        let store = self.stores.store(location.bucket())?;

        let mut files = Vec::with_capacity(objects.len());
        for object in objects {
            let bytes = store
                .get(&object)
                .await
                .map_err(CommonError::from)?
                .bytes()
                .await
                .map_err(CommonError::from)?;
            let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;
            let schema = reader.schema();
            let batches = reader.collect::<Result<Vec<_>, _>>()?;
            debug!(object = %object, rows = count_rows(&batches), "Read staged file");
            files.push((schema, batches));
        }
        Ok(files)
    }
}

/// Schema after loading `incoming` into a table with schema `existing`.
///
/// Existing columns keep their position and type. Columns only present in
/// `incoming` are appended as nullable when `allow_addition` is set.
fn widen_schema(
    existing: &Schema,
    incoming: &Schema,
    allow_addition: bool,
) -> WarehouseResult<SchemaRef> {
    let mut fields: Vec<FieldRef> = existing.fields().iter().cloned().collect();
    for field in incoming.fields() {
        if existing.field_with_name(field.name()).is_ok() {
            continue;
        }
        if !allow_addition {
            return Err(WarehouseError::SchemaMismatch(format!(
                "column '{}' is not in the table and field addition is not allowed",
                field.name()
            )));
        }
        fields.push(Arc::new(Field::new(
            field.name(),
            field.data_type().clone(),
            true,
        )));
    }
    Ok(Arc::new(Schema::new_with_metadata(
        fields,
        existing.metadata().clone(),
    )))
}

/// Rearrange `batch` to `target`: cast matching columns, fill absent
/// nullable ones with nulls. A value the cast cannot represent fails the
/// batch instead of turning into a null.
fn conform_batch(batch: &RecordBatch, target: &SchemaRef) -> WarehouseResult<RecordBatch> {
    let source = batch.schema();
    if let Some(extra) = source
        .fields()
        .iter()
        .find(|field| target.field_with_name(field.name()).is_err())
    {
        return Err(WarehouseError::SchemaMismatch(format!(
            "column '{}' is not part of the target schema",
            extra.name()
        )));
    }

    let columns = target
        .fields()
        .iter()
        .map(|field| match source.index_of(field.name()) {
            Ok(index) => {
                let column = batch.column(index);
                if column.data_type() == field.data_type() {
                    return Ok(column.clone());
                }
                let options = CastOptions {
                    safe: false,
                    ..Default::default()
                };
                cast_with_options(column, field.data_type(), &options).map_err(|e| {
                    WarehouseError::SchemaMismatch(format!(
                        "column '{}' cannot be loaded as {}: {}",
                        field.name(),
                        field.data_type(),
                        e
                    ))
                })
            }
            Err(_) if field.is_nullable() => {
                Ok(new_null_array(field.data_type(), batch.num_rows()))
            }
            Err(_) => Err(WarehouseError::SchemaMismatch(format!(
                "required column '{}' is missing from the loaded data",
                field.name()
            ))),
        })
        .collect::<WarehouseResult<Vec<ArrayRef>>>()?;

    Ok(RecordBatch::try_new(target.clone(), columns)?)
}

fn conform_all(batches: &[RecordBatch], target: &SchemaRef) -> WarehouseResult<Vec<RecordBatch>> {
    batches
        .iter()
        .map(|batch| conform_batch(batch, target))
        .collect()
}

#[async_trait]
impl Warehouse for LocalWarehouse {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::DataFusion
    }

    async fn query(&self, sql: &str, params: &[QueryParameter]) -> WarehouseResult<QueryJob> {
        let start = Instant::now();
        let mut df = self.ctx.sql(sql).await?;
        if !params.is_empty() {
            let values: Vec<(String, ScalarValue)> = params
                .iter()
                .map(|param| (param.name.clone(), param.value.to_scalar()))
                .collect();
            df = df.with_param_values(values)?;
        }
        let schema: SchemaRef = Arc::new(df.schema().as_arrow().clone());
        let batches = df.collect().await?;

        let bytes_processed: u64 = batches
            .iter()
            .map(|batch| batch.get_array_memory_size() as u64)
            .sum();
        Ok(QueryJob {
            job_id: format!("local_{}", Uuid::new_v4().simple()),
            schema,
            batches,
            statistics: JobStatistics {
                bytes_processed,
                bytes_billed: bytes_processed,
                slot_millis: start.elapsed().as_millis() as u64,
            },
        })
    }

    async fn load_from_uri(
        &self,
        uri: &str,
        target: &TableId,
        config: &LoadJobConfig,
    ) -> WarehouseResult<()> {
        let files = self.read_staged(uri).await?;

        let incoming: SchemaRef = match &config.schema {
            Some(fields) => arrow_schema(fields),
            None => {
                let schemas = files.iter().map(|(schema, _)| schema.as_ref().clone());
                Arc::new(Schema::try_merge(schemas).map_err(|e| {
                    WarehouseError::SchemaMismatch(format!(
                        "staged files under {} disagree: {}",
                        uri, e
                    ))
                })?)
            }
        };
        let mut loaded = Vec::new();
        for (_, batches) in &files {
            loaded.extend(conform_all(batches, &incoming)?);
        }

        let _guard = self.write_lock.lock().await;
        let (schema, batches) = match self.snapshot(target).await? {
            None => (incoming, loaded),
            Some((existing, existing_rows)) => match config.write_disposition {
                WriteDisposition::Empty => {
                    if count_rows(&existing_rows) > 0 {
                        return Err(WarehouseError::TableNotEmpty(target.to_string()));
                    }
                    let schema = widen_schema(&existing, &incoming, false)?;
                    let rows = conform_all(&loaded, &schema)?;
                    (schema, rows)
                }
                WriteDisposition::Append => {
                    let schema = widen_schema(&existing, &incoming, config.allow_field_addition)?;
                    let mut rows = conform_all(&existing_rows, &schema)?;
                    rows.extend(conform_all(&loaded, &schema)?);
                    (schema, rows)
                }
                WriteDisposition::Truncate => {
                    let schema = widen_schema(&existing, &incoming, config.allow_field_addition)?;
                    let rows = conform_all(&loaded, &schema)?;
                    (schema, rows)
                }
            },
        };

        info!(
            uri,
            table = %target,
            disposition = %config.write_disposition,
            rows = count_rows(&batches),
            "Load job finished"
        );
        self.replace_table(target, schema, batches)
    }

    async fn table_num_rows(&self, target: &TableId) -> WarehouseResult<u64> {
        if self.table_provider(target).await?.is_none() {
            return Err(WarehouseError::NotFound(target.to_string()));
        }
        let rows = self
            .ctx
            .table(Self::table_reference(target))
            .await?
            .count()
            .await?;
        Ok(rows as u64)
    }

    async fn delete_table(&self, target: &TableId, not_found_ok: bool) -> WarehouseResult<()> {
        let _guard = self.write_lock.lock().await;
        let removed = match self.dataset(target) {
            Some(dataset) => dataset.deregister_table(&target.table)?.is_some(),
            None => false,
        };
        self.clustering
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(target);
        if removed || not_found_ok {
            Ok(())
        } else {
            Err(WarehouseError::NotFound(target.to_string()))
        }
    }

    async fn set_clustering_fields(
        &self,
        target: &TableId,
        fields: &[String],
    ) -> WarehouseResult<()> {
        let schema = self
            .table_schema(target)
            .await?
            .ok_or_else(|| WarehouseError::NotFound(target.to_string()))?;
        if fields.len() > MAX_CLUSTERING_FIELDS {
            return Err(WarehouseError::InvalidArgument(format!(
                "at most {} clustering fields are allowed, got {}",
                MAX_CLUSTERING_FIELDS,
                fields.len()
            )));
        }
        if let Some(missing) = fields.iter().find(|f| schema.field_with_name(f).is_err()) {
            return Err(WarehouseError::InvalidArgument(format!(
                "clustering field '{}' is not a column of {}",
                missing, target
            )));
        }
        self.clustering
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(target.clone(), fields.to_vec());
        Ok(())
    }
}
