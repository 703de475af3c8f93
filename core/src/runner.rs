//! Warehouse query runner.
//!
//! Runs a parameterized query to completion, charges its billed bytes to the
//! shared [`CostLedger`] and reports how long it took.

use crate::config::{MEGA, PricingConfig};
use crate::error::WarehouseResult;
use crate::ledger::{CostLedger, billed_cost};
use crate::warehouse::{QueryParameter, QueryRows, Warehouse};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / MEGA as f64
}

#[derive(Debug, Clone)]
pub struct QueryRunner {
    warehouse: Arc<dyn Warehouse>,
    ledger: Arc<CostLedger>,
    pricing: PricingConfig,
}

impl QueryRunner {
    pub fn new(warehouse: Arc<dyn Warehouse>, ledger: Arc<CostLedger>, pricing: PricingConfig) -> Self {
        Self {
            warehouse,
            ledger,
            pricing,
        }
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    /// Run `sql` and return its rows together with the elapsed wall-clock
    /// seconds. The job's cost is on the ledger before this returns.
    ///
    /// A failed query is logged with its text and parameters and the
    /// warehouse error is returned as-is.
    pub async fn run_query(
        &self,
        sql: &str,
        params: &[QueryParameter],
    ) -> WarehouseResult<(QueryRows, f64)> {
        let start = Instant::now();
        let job = match self.warehouse.query(sql, params).await {
            Ok(job) => job,
            Err(e) => {
                let parameters: Vec<String> = params.iter().map(ToString::to_string).collect();
                debug!(query = sql, ?parameters, error = %e, "Query failed");
                return Err(e);
            }
        };
        let elapsed = start.elapsed();

        let stats = job.statistics;
        let cost = billed_cost(stats.bytes_billed, self.pricing.price_per_10mib);
        let total_cost = self.ledger.record(cost);
        debug!(
            job_id = %job.job_id,
            processed_mb = megabytes(stats.bytes_processed),
            billed_mb = megabytes(stats.bytes_billed),
            elapsed_secs = elapsed.as_secs_f64(),
            slot_secs = stats.slot_millis as f64 / 1000.0,
            cost,
            total_cost,
            "Query finished"
        );
        if elapsed > self.pricing.slow_query_threshold() {
            warn!(
                elapsed_secs = elapsed.as_secs_f64(),
                query = sql,
                "Slow query"
            );
        }

        Ok((job.into_rows(), elapsed.as_secs_f64()))
    }

    /// [`run_query`](Self::run_query) without the timing.
    pub async fn run_query_rows(
        &self,
        sql: &str,
        params: &[QueryParameter],
    ) -> WarehouseResult<QueryRows> {
        self.run_query(sql, params).await.map(|(rows, _)| rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PRICE_PER_10MIB;
    use crate::warehouse::LocalWarehouse;
    use ferry_common::BucketStores;
    use tracing_test::traced_test;

    fn runner(pricing: PricingConfig) -> QueryRunner {
        let warehouse = Arc::new(LocalWarehouse::new(Arc::new(BucketStores::in_memory())));
        QueryRunner::new(warehouse, Arc::new(CostLedger::new()), pricing)
    }

    #[tokio::test]
    async fn test_query_cost_is_recorded() {
        let runner = runner(PricingConfig::default());
        let (rows, elapsed) = runner
            .run_query("SELECT 1 AS x", &[])
            .await
            .expect("Failed to run query");

        assert_eq!(rows.total_rows(), 1);
        assert!(elapsed >= 0.0);
        // A tiny result still bills one full block.
        assert_eq!(runner.ledger().total_cost(), DEFAULT_PRICE_PER_10MIB);
        assert_eq!(runner.ledger().entries(), 1);
    }

    #[tokio::test]
    async fn test_empty_result_is_not_an_error() {
        let runner = runner(PricingConfig::default());
        let rows = runner
            .run_query_rows("SELECT 1 AS x WHERE 1 = 0", &[])
            .await
            .expect("Failed to run query");
        assert_eq!(rows.total_rows(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_slow_query_warns_with_query_text() {
        let runner = runner(PricingConfig {
            slow_query_threshold_secs: 0.0,
            ..PricingConfig::default()
        });
        runner
            .run_query("SELECT 42 AS slow_marker", &[])
            .await
            .expect("Failed to run query");

        assert!(logs_contain("Slow query"));
        assert!(logs_contain("SELECT 42 AS slow_marker"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_query_is_logged_and_returned() {
        let runner = runner(PricingConfig::default());
        let err = runner
            .run_query(
                "SELECT * FROM no_such_table WHERE id = $id",
                &[QueryParameter::int64("id", 7)],
            )
            .await
            .expect_err("table does not exist");

        assert!(err.to_string().contains("no_such_table"));
        assert!(logs_contain("Query failed"));
        assert!(logs_contain("id INT64 = 7"));
        assert_eq!(runner.ledger().total_cost(), 0.0);
    }
}
