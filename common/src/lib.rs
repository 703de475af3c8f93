//! Shared building blocks for Ferry.
//!
//! This crate holds the error taxonomy and the object-storage layer used to
//! stage columnar files before they are batch-loaded into a warehouse.

pub mod error;
pub mod storage;

pub use error::{CommonError, ErrorContext, Result};
pub use storage::{BucketStores, BucketUri, ObjectStoreStager, Stager, StagingStats, StorageBackend};
