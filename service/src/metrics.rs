//! Counters for service monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sellercredit_common::{CreditError, ErrorClass};

/// Service counters.
pub struct Metrics {
    /// Sale requests received.
    pub sales_attempted: AtomicU64,
    /// Sales committed.
    pub sales_succeeded: AtomicU64,
    /// Sales refused for client-side reasons.
    pub sales_rejected: AtomicU64,
    /// Sales that failed on the server side.
    pub sales_failed: AtomicU64,
    /// Deposit requests submitted.
    pub deposits_requested: AtomicU64,
    /// Deposit requests approved.
    pub deposits_approved: AtomicU64,
    /// Deposit requests rejected.
    pub deposits_rejected: AtomicU64,
    /// Mutations that timed out waiting for a credit lock or unit bound.
    pub lock_timeouts: AtomicU64,
    /// Mutations currently in progress.
    pub mutations_active: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            sales_attempted: AtomicU64::new(0),
            sales_succeeded: AtomicU64::new(0),
            sales_rejected: AtomicU64::new(0),
            sales_failed: AtomicU64::new(0),
            deposits_requested: AtomicU64::new(0),
            deposits_approved: AtomicU64::new(0),
            deposits_rejected: AtomicU64::new(0),
            lock_timeouts: AtomicU64::new(0),
            mutations_active: AtomicU64::new(0),
        }
    }

    /// Record a sale request.
    pub fn sale_attempted(&self) {
        self.sales_attempted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of a sale.
    pub fn sale_finished<T>(&self, outcome: &Result<T, CreditError>) {
        match outcome {
            Ok(_) => {
                self.sales_succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.record_timeout(err);
                if matches!(err.error_class(), ErrorClass::Transient | ErrorClass::Server) {
                    self.sales_failed.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.sales_rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Record a submitted deposit request.
    pub fn deposit_requested(&self) {
        self.deposits_requested.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a deposit approval.
    pub fn deposit_approved(&self) {
        self.deposits_approved.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a deposit rejection.
    pub fn deposit_rejected(&self) {
        self.deposits_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Count `err` if it is a lock or unit timeout.
    pub fn record_timeout(&self, err: &CreditError) {
        if matches!(err, CreditError::ConflictTimeout(_)) {
            self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Mark a mutation as in flight until the returned guard drops.
    pub fn track_mutation(self: &Arc<Self>) -> MutationGuard {
        self.mutations_active.fetch_add(1, Ordering::Relaxed);
        MutationGuard {
            metrics: Arc::clone(self),
        }
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sales_attempted: self.sales_attempted.load(Ordering::Relaxed),
            sales_succeeded: self.sales_succeeded.load(Ordering::Relaxed),
            sales_rejected: self.sales_rejected.load(Ordering::Relaxed),
            sales_failed: self.sales_failed.load(Ordering::Relaxed),
            deposits_requested: self.deposits_requested.load(Ordering::Relaxed),
            deposits_approved: self.deposits_approved.load(Ordering::Relaxed),
            deposits_rejected: self.deposits_rejected.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            mutations_active: self.mutations_active.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let counters = [
            ("sales_attempted", "Sale requests received", "counter", snapshot.sales_attempted),
            ("sales_succeeded", "Sales committed", "counter", snapshot.sales_succeeded),
            ("sales_rejected", "Sales refused for client-side reasons", "counter", snapshot.sales_rejected),
            ("sales_failed", "Sales failed on the server side", "counter", snapshot.sales_failed),
            ("deposits_requested", "Deposit requests submitted", "counter", snapshot.deposits_requested),
            ("deposits_approved", "Deposit requests approved", "counter", snapshot.deposits_approved),
            ("deposits_rejected", "Deposit requests rejected", "counter", snapshot.deposits_rejected),
            ("lock_timeouts", "Mutations that timed out on a credit lock", "counter", snapshot.lock_timeouts),
            ("mutations_active", "Mutations in progress", "gauge", snapshot.mutations_active),
        ];

        let mut output = String::new();
        for (name, help, kind, value) in counters {
            output.push_str(&format!(
                "# HELP sellercredit_{name} {help}\n# TYPE sellercredit_{name} {kind}\nsellercredit_{name} {value}\n\n"
            ));
        }
        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight gauge on drop.
pub struct MutationGuard {
    metrics: Arc<Metrics>,
}

impl Drop for MutationGuard {
    fn drop(&mut self) {
        self.metrics.mutations_active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sales_attempted: u64,
    pub sales_succeeded: u64,
    pub sales_rejected: u64,
    pub sales_failed: u64,
    pub deposits_requested: u64,
    pub deposits_approved: u64,
    pub deposits_rejected: u64,
    pub lock_timeouts: u64,
    pub mutations_active: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;
