//! Shared helpers for the integration tests.

use ferry_core::{FerryConfig, FerryContext};
use std::path::PathBuf;
use tempfile::TempDir;

/// Context on the in-process warehouse with in-memory buckets.
pub fn local_context() -> FerryContext {
    FerryContext::local(FerryConfig::default()).expect("Failed to create local context")
}

/// Materialize `sql` from an empty DataFusion source, write it to
/// `file_name` and stage it under `bucket_uri`. Returns the staged URI.
pub async fn stage_query(
    context: &FerryContext,
    sql: &str,
    file_name: &str,
    bucket_uri: &str,
) -> String {
    let scratch = TempDir::new().expect("Failed to create temp directory");
    let (table, _) = context
        .load_local_query("memory://", sql)
        .await
        .expect("Failed to materialize source query");
    let path: PathBuf = context
        .write_staging_file(&table, scratch.path().join(file_name))
        .await
        .expect("Failed to write staging file");
    context
        .stage_file(&path, bucket_uri)
        .await
        .expect("Failed to stage file")
}
