//! Batch loads of staged Parquet into warehouse tables.

use crate::error::WarehouseResult;
use crate::warehouse::{LoadJobConfig, SchemaField, TableId, Warehouse, WriteDisposition};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct BatchLoader {
    warehouse: Arc<dyn Warehouse>,
}

impl BatchLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    /// Load the Parquet object(s) at `staged_uri` into `target` and return
    /// the table's row count afterwards.
    ///
    /// Without `schema` the column layout is detected from the files. New
    /// columns are accepted for `Append` and `Truncate` only.
    pub async fn batch_load(
        &self,
        staged_uri: &str,
        target: &TableId,
        disposition: WriteDisposition,
        schema: Option<Vec<SchemaField>>,
    ) -> WarehouseResult<u64> {
        let config = LoadJobConfig::new(disposition, schema);
        debug!(
            uri = staged_uri,
            table = %target,
            disposition = %disposition,
            autodetect = config.autodetect,
            allow_field_addition = config.allow_field_addition,
            "Starting load job"
        );
        if let Err(e) = self
            .warehouse
            .load_from_uri(staged_uri, target, &config)
            .await
        {
            debug!(uri = staged_uri, table = %target, error = %e, "Load job failed");
            return Err(e);
        }

        let rows = self.warehouse.table_num_rows(target).await?;
        info!(table = %target, rows, "Table loaded");
        Ok(rows)
    }
}
