//! Staging through a configured storage backend.

use ferry_common::StorageBackend;
use ferry_core::{FerryConfig, FerryContext, TableId, WriteDisposition};
use tempfile::TempDir;

#[tokio::test]
async fn test_local_filesystem_staging_from_json_config() {
    let root = TempDir::new().expect("Failed to create temp directory");
    let scratch = TempDir::new().expect("Failed to create temp directory");
    let json = format!(
        r#"{{ "storage": {{ "type": "local_file_system", "root_path": "{}" }} }}"#,
        root.path().display()
    );
    let config = FerryConfig::from_json_str(&json).expect("Failed to parse config");
    assert!(matches!(config.storage, StorageBackend::LocalFileSystem { .. }));
    let context = FerryContext::local(config).expect("Failed to create context");

    let (table, size) = context
        .load_local_query("memory://", "SELECT 'a' AS letter UNION ALL SELECT 'b' AS letter")
        .await
        .expect("Failed to materialize");
    assert_eq!(table.num_rows(), 2);
    assert!(size > 0);

    let file = context
        .write_staging_file(&table, scratch.path().join("letters.parquet"))
        .await
        .expect("Failed to write parquet");
    let staged = context
        .stage_file(&file, "gs://landing/run_1")
        .await
        .expect("Failed to stage");
    assert_eq!(staged, "gs://landing/run_1/letters.parquet");
    assert!(root.path().join("landing/run_1/letters.parquet").exists());

    let rows = context
        .batch_load(
            "gs://landing/run_1/*.parquet",
            &TableId::new("proj", "ds", "letters"),
            WriteDisposition::Empty,
            None,
        )
        .await
        .expect("Failed to load");
    assert_eq!(rows, 2);

    context
        .delete_from_bucket("gs://landing/run_1")
        .await
        .expect("Failed to clean up");
    assert!(!root.path().join("landing/run_1/letters.parquet").exists());
}

#[tokio::test]
async fn test_deleting_unknown_prefix_succeeds() {
    let context = FerryContext::local(FerryConfig::default()).expect("Failed to create context");
    let removed = context
        .delete_from_bucket("gs://nothing-here/at/all")
        .await
        .expect("Missing prefix is not an error");
    assert_eq!(removed, 0);
}
