//! Cost ledger
//!
//! The ledger is an add-only accumulator of warehouse query cost. One ledger
//! is created per pipeline and shared (via `Arc`) with every component that
//! reports cost, so two pipelines in one process keep separate totals.

use crate::config::BILLING_BLOCK_BYTES;
use std::sync::Mutex;

/// Billed cost of a query: `ceil(bytes_billed / 10 MiB) * price_per_10mib`.
///
/// Partial blocks are charged as full blocks.
pub fn billed_cost(bytes_billed: u64, price_per_10mib: f64) -> f64 {
    let blocks = bytes_billed.div_ceil(BILLING_BLOCK_BYTES);
    blocks as f64 * price_per_10mib
}

#[derive(Debug, Default)]
struct LedgerState {
    total: f64,
    entries: u64,
}

/// Thread-safe running total of query cost.
#[derive(Debug, Default)]
pub struct CostLedger {
    state: Mutex<LedgerState>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the cost of one completed job and return the new total.
    ///
    /// Negative amounts are ignored; the total never decreases.
    pub fn record(&self, cost: f64) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if cost.is_finite() && cost > 0.0 {
            state.total += cost;
        }
        state.entries += 1;
        state.total
    }

    /// Accumulated cost in currency units.
    pub fn total_cost(&self) -> f64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).total
    }

    /// Number of jobs recorded so far.
    pub fn entries(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_PRICE_PER_10MIB, MEGA};
    use std::sync::Arc;

    #[test]
    fn test_zero_bytes_cost_nothing() {
        assert_eq!(billed_cost(0, DEFAULT_PRICE_PER_10MIB), 0.0);
    }

    #[test]
    fn test_partial_block_rounds_up() {
        assert_eq!(billed_cost(1, 2.0), 2.0);
        assert_eq!(billed_cost(10 * MEGA - 1, 2.0), 2.0);
        assert_eq!(billed_cost(10 * MEGA, 2.0), 2.0);
        assert_eq!(billed_cost(10 * MEGA + 1, 2.0), 4.0);
    }

    #[test]
    fn test_one_tebibyte_costs_six() {
        let cost = billed_cost(1024 * 1024 * MEGA, DEFAULT_PRICE_PER_10MIB);
        assert!((cost - 6.0).abs() < 1e-4);
    }

    #[test]
    fn test_ledger_accumulates() {
        let ledger = CostLedger::new();
        assert_eq!(ledger.total_cost(), 0.0);
        ledger.record(0.25);
        ledger.record(0.5);
        assert_eq!(ledger.total_cost(), 0.75);
        assert_eq!(ledger.entries(), 2);
    }

    #[test]
    fn test_ledger_never_decreases() {
        let ledger = CostLedger::new();
        ledger.record(1.0);
        ledger.record(-5.0);
        ledger.record(f64::NAN);
        assert_eq!(ledger.total_cost(), 1.0);
    }

    #[test]
    fn test_concurrent_records_sum_exactly() {
        let ledger = Arc::new(CostLedger::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        ledger.record(0.5);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }
        assert_eq!(ledger.total_cost(), 8000.0);
        assert_eq!(ledger.entries(), 16_000);
    }
}
