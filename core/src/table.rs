//! In-memory columnar tables produced by source queries.

use arrow::array::{Array, ArrayRef, MutableArrayData, make_array};
use arrow::datatypes::SchemaRef;
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use datafusion::parquet::arrow::ArrowWriter;
use ferry_common::{CommonError, ErrorContext};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Immutable, schema-typed table held as Arrow record batches.
#[derive(Debug, Clone)]
pub struct ColumnarTable {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

impl ColumnarTable {
    /// Build a table from batches sharing `schema`.
    pub fn try_new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<Self, ArrowError> {
        for batch in &batches {
            if batch.schema().fields() != schema.fields() {
                return Err(ArrowError::SchemaError(format!(
                    "batch schema {:?} does not match table schema {:?}",
                    batch.schema(),
                    schema
                )));
            }
        }
        Ok(Self { schema, batches })
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|batch| batch.num_rows()).sum()
    }

    pub fn num_columns(&self) -> usize {
        self.schema.fields().len()
    }

    /// Memory held by the table's buffers, in bytes.
    pub fn byte_size(&self) -> usize {
        self.batches
            .iter()
            .map(|batch| batch.get_array_memory_size())
            .sum()
    }

    /// Copy every column into freshly allocated buffers.
    ///
    /// The copy shares no memory with `self`, so it stays valid even if the
    /// producer of the original buffers reuses them afterwards.
    pub fn deep_copy(&self) -> Result<Self, ArrowError> {
        let batches = self
            .batches
            .iter()
            .map(|batch| {
                let columns = batch.columns().iter().map(copy_array).collect::<Vec<_>>();
                RecordBatch::try_new(batch.schema(), columns)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            schema: self.schema.clone(),
            batches,
        })
    }

    /// Write the table to a single Parquet file at `path`.
    pub fn write_parquet(&self, path: impl AsRef<Path>) -> ferry_common::Result<PathBuf> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_io_context(|| format!("Failed to create {}", path.display()))?;
        let mut writer = ArrowWriter::try_new(file, self.schema.clone(), None).map_err(|e| {
            CommonError::io_error_with_source(
                format!("Failed to open Parquet writer for {}", path.display()),
                e,
            )
        })?;
        for batch in &self.batches {
            writer.write(batch).map_err(|e| {
                CommonError::io_error_with_source(
                    format!("Failed to write batch to {}", path.display()),
                    e,
                )
            })?;
        }
        writer.close().map_err(|e| {
            CommonError::io_error_with_source(format!("Failed to finish {}", path.display()), e)
        })?;
        Ok(path.to_path_buf())
    }
}

fn copy_array(array: &ArrayRef) -> ArrayRef {
    let data = array.to_data();
    let mut copy = MutableArrayData::new(vec![&data], false, data.len());
    copy.extend(0, 0, data.len());
    make_array(copy.freeze())
}

impl From<RecordBatch> for ColumnarTable {
    fn from(batch: RecordBatch) -> Self {
        Self {
            schema: batch.schema(),
            batches: vec![batch],
        }
    }
}

/// Total number of rows in `batches`.
pub fn count_rows(batches: &[RecordBatch]) -> usize {
    batches.iter().map(|batch| batch.num_rows()).sum()
}
