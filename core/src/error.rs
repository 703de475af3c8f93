//! Error types for the warehouse, source and facade layers.
//!
//! Components never turn one kind of failure into another: they log the
//! context they have and hand the original error back to the caller.

use arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use datafusion::parquet::errors::ParquetError;
use ferry_common::CommonError;
use thiserror::Error;

/// Text carried by connector errors that signal an unusable credential.
pub const TOKEN_ERROR_MARKER: &str = "Token error";

/// Failures raised while reading from a source database.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source connection failed: {0}")]
    Connection(String),

    #[error("Source query failed: {0}")]
    Query(String),

    #[error("Source authentication failed: {0}")]
    Authentication(String),

    #[error(transparent)]
    DataFusion(#[from] DataFusionError),

    #[error(transparent)]
    Arrow(#[from] ArrowError),
}

impl SourceError {
    /// True when retrying cannot help because the credential itself was
    /// rejected.
    pub fn is_credential_error(&self) -> bool {
        matches!(self, SourceError::Authentication(_))
            || self.to_string().contains(TOKEN_ERROR_MARKER)
    }
}

/// Failures raised by a warehouse backend.
#[derive(Error, Debug)]
pub enum WarehouseError {
    #[error("Warehouse job {job_id} failed ({reason}): {message}")]
    Job {
        job_id: String,
        reason: String,
        message: String,
    },

    #[error("Warehouse API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Table {0} already contains rows")]
    TableNotEmpty(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unexpected warehouse response: {0}")]
    Decode(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    DataFusion(#[from] DataFusionError),

    #[error(transparent)]
    Arrow(#[from] ArrowError),

    #[error(transparent)]
    Parquet(#[from] ParquetError),

    #[error(transparent)]
    Storage(#[from] CommonError),
}

impl WarehouseError {
    pub fn is_not_found(&self) -> bool {
        match self {
            WarehouseError::NotFound(_) => true,
            WarehouseError::Api { status, .. } => *status == 404,
            WarehouseError::Storage(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Error type of the [`crate::FerryContext`] facade.
#[derive(Error, Debug)]
pub enum FerryError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error(transparent)]
    Storage(#[from] CommonError),
}

pub type SourceResult<T> = std::result::Result<T, SourceError>;
pub type WarehouseResult<T> = std::result::Result<T, WarehouseError>;
pub type FerryResult<T> = std::result::Result<T, FerryError>;
