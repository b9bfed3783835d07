//! Simulation metrics.

use std::collections::VecDeque;

use serde::Serialize;

use sellercredit_common::{CreditError, ErrorClass};

/// What a simulated request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Sale,
    DepositApproved,
    DepositRejected,
}

/// Simulation metrics.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationMetrics {
    /// Requests issued.
    pub total_requests: u64,
    /// Sales committed.
    pub sales_succeeded: u64,
    /// Sales refused for insufficient balance.
    pub sales_insufficient: u64,
    /// Deposits approved.
    pub deposits_approved: u64,
    /// Deposits rejected by the simulated administrator.
    pub deposits_rejected: u64,
    /// Requests that hit a lock or unit timeout.
    pub timeouts: u64,
    /// Other failures.
    pub errors: u64,
    #[serde(skip)]
    latency_samples: VecDeque<u64>,
    #[serde(skip)]
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_requests: 0,
            sales_succeeded: 0,
            sales_insufficient: 0,
            deposits_approved: 0,
            deposits_rejected: 0,
            timeouts: 0,
            errors: 0,
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record a completed request.
    pub fn record_success(&mut self, operation: Operation, latency_us: u64) {
        self.total_requests += 1;
        match operation {
            Operation::Sale => self.sales_succeeded += 1,
            Operation::DepositApproved => self.deposits_approved += 1,
            Operation::DepositRejected => self.deposits_rejected += 1,
        }

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_us);
    }

    /// Record a failed request.
    pub fn record_failure(&mut self, err: &CreditError) {
        self.total_requests += 1;
        match err {
            CreditError::InsufficientBalance { .. } => self.sales_insufficient += 1,
            err if err.error_class() == ErrorClass::Transient => self.timeouts += 1,
            _ => self.errors += 1,
        }
    }

    /// Get average latency in microseconds.
    pub fn average_latency_us(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    pub fn p50_latency_us(&self) -> u64 {
        self.percentile_latency(50)
    }

    pub fn p99_latency_us(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Requests per second over the given wall time.
    pub fn throughput(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs <= 0.0 {
            return 0.0;
        }

        self.total_requests as f64 / elapsed_secs
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_metrics() {
        let mut metrics = SimulationMetrics::new();

        metrics.record_success(Operation::Sale, 100);
        metrics.record_success(Operation::DepositApproved, 200);
        metrics.record_success(Operation::Sale, 150);
        metrics.record_failure(&CreditError::InsufficientBalance {
            required: Decimal::from(1000),
            available: Decimal::ZERO,
        });
        metrics.record_failure(&CreditError::ConflictTimeout("lock".into()));

        assert_eq!(metrics.total_requests, 5);
        assert_eq!(metrics.sales_succeeded, 2);
        assert_eq!(metrics.sales_insufficient, 1);
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.average_latency_us(), 150);
        assert_eq!(metrics.p99_latency_us(), 200);
    }
}
