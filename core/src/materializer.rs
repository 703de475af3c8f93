//! Source query materializer.

use crate::config::{MEGA, RetryConfig};
use crate::error::{SourceError, SourceResult};
use crate::retry::RetryPolicy;
use crate::source::SourceConnector;
use crate::table::ColumnarTable;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Reads a source query into memory through a [`SourceConnector`], retrying
/// transient failures.
#[derive(Debug, Clone)]
pub struct Materializer {
    connector: Arc<dyn SourceConnector>,
    policy: RetryPolicy<SourceError>,
}

impl Materializer {
    pub fn new(connector: Arc<dyn SourceConnector>, policy: RetryPolicy<SourceError>) -> Self {
        Self { connector, policy }
    }

    /// Backoff from `config`; rejected credentials are never retried.
    pub fn from_config(connector: Arc<dyn SourceConnector>, config: &RetryConfig) -> Self {
        let policy =
            RetryPolicy::from_config(config).with_give_up(SourceError::is_credential_error);
        Self::new(connector, policy)
    }

    pub fn policy(&self) -> &RetryPolicy<SourceError> {
        &self.policy
    }

    /// Run `sql` against `connection` and return the result with its size
    /// in bytes. The returned table owns its buffers outright.
    pub async fn materialize(
        &self,
        connection: &str,
        sql: &str,
    ) -> SourceResult<(ColumnarTable, usize)> {
        let start = Instant::now();
        let table = self
            .policy
            .run(|attempt| {
                debug!(attempt, "Reading source query");
                self.connector.read_sql(connection, sql)
            })
            .await?;
        let table = table.deep_copy()?;
        let size = table.byte_size();

        debug!(
            rows = table.num_rows(),
            size_mb = size as f64 / MEGA as f64,
            elapsed_secs = start.elapsed().as_secs_f64(),
            "Materialized source query"
        );
        Ok((table, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::ExponentialBackoff;
    use arrow::array::{Array, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails with `error` for the first `failures` calls.
    #[derive(Debug)]
    struct FlakyConnector {
        failures: u32,
        error: fn(u32) -> SourceError,
        calls: AtomicU32,
    }

    impl FlakyConnector {
        fn new(failures: u32, error: fn(u32) -> SourceError) -> Self {
            Self {
                failures,
                error,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SourceConnector for FlakyConnector {
        async fn read_sql(&self, _connection: &str, _sql: &str) -> SourceResult<ColumnarTable> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err((self.error)(call));
            }
            let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
            let batch = RecordBatch::try_new(
                schema,
                vec![Arc::new(Int64Array::from(vec![1, i64::from(call)]))],
            )?;
            Ok(ColumnarTable::from(batch))
        }
    }

    fn transient(call: u32) -> SourceError {
        SourceError::Connection(format!("connection reset ({})", call))
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy<SourceError> {
        RetryPolicy::new(
            max_attempts,
            Duration::from_secs(10),
            ExponentialBackoff::new(Duration::from_millis(1), 2.0, Duration::from_millis(5)),
        )
        .with_give_up(SourceError::is_credential_error)
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let connector = Arc::new(FlakyConnector::new(3, transient));
        let materializer = Materializer::new(connector.clone(), fast_policy(20));

        let (table, size) = materializer
            .materialize("memory://", "SELECT 1 AS x")
            .await
            .expect("Failed to materialize");
        assert_eq!(table.num_rows(), 2);
        assert_eq!(size, table.byte_size());
        assert_eq!(connector.calls(), 4);

        let values = table.batches()[0]
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int column");
        assert_eq!(values.values().to_vec(), vec![1, 4]);
    }

    #[tokio::test]
    async fn test_token_error_is_not_retried() {
        let connector = Arc::new(FlakyConnector::new(u32::MAX, |_| {
            SourceError::Connection("Token error: invalid_grant".to_string())
        }));
        let materializer = Materializer::new(connector.clone(), fast_policy(20));

        let err = materializer
            .materialize("memory://", "SELECT 1")
            .await
            .expect_err("credential errors abort");
        assert!(err.is_credential_error());
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test]
    async fn test_authentication_error_is_not_retried() {
        let connector = Arc::new(FlakyConnector::new(u32::MAX, |_| {
            SourceError::Authentication("expired".to_string())
        }));
        let materializer = Materializer::new(connector.clone(), fast_policy(20));

        assert!(materializer.materialize("memory://", "SELECT 1").await.is_err());
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_return_last_error() {
        let connector = Arc::new(FlakyConnector::new(u32::MAX, transient));
        let materializer = Materializer::new(connector.clone(), fast_policy(3));

        let err = materializer
            .materialize("memory://", "SELECT 1")
            .await
            .expect_err("always failing");
        assert_eq!(err.to_string(), "Source connection failed: connection reset (3)");
        assert_eq!(connector.calls(), 3);
    }

    #[test]
    fn test_config_policy_gives_up_on_credentials() {
        let connector = Arc::new(FlakyConnector::new(0, transient));
        let materializer = Materializer::from_config(connector, &RetryConfig::default());
        assert_eq!(materializer.policy().max_attempts, 20);
        assert!(
            materializer
                .policy()
                .should_give_up(&SourceError::Authentication("x".to_string()))
        );
        assert!(!materializer.policy().should_give_up(&transient(1)));
    }
}
