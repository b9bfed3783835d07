//! Per-seller exclusive locks for the in-memory store.
//!
//! Each seller id maps to its own async mutex, so mutations for one seller
//! queue behind each other while other sellers proceed untouched. Waiting is
//! bounded; a guard is released on every exit path because it is dropped with
//! the unit of work that holds it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use sellercredit_common::{CreditError, Result, SellerId};

/// Exclusive hold on one seller's credit.
#[derive(Debug)]
pub struct CreditLock {
    seller_id: SellerId,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl CreditLock {
    /// Seller this lock covers.
    pub fn seller_id(&self) -> SellerId {
        self.seller_id
    }

    /// How long the lock has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for CreditLock {
    fn drop(&mut self) {
        debug!(
            seller_id = %self.seller_id,
            held_us = self.held_for().as_micros() as u64,
            "Credit lock released"
        );
    }
}

/// Lock table statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockStats {
    /// Locks granted since creation.
    pub acquired: u64,
    /// Acquisitions that gave up waiting.
    pub timeouts: u64,
    /// Seller slots currently tracked.
    pub slots: usize,
}

/// Table of per-seller locks.
pub struct LockTable {
    slots: DashMap<SellerId, Arc<Mutex<()>>>,
    acquire_timeout: Duration,
    acquired: AtomicU64,
    timeouts: AtomicU64,
}

impl LockTable {
    /// Create a lock table with a bounded acquire wait.
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            acquire_timeout,
            acquired: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Acquire the lock for a seller, waiting at most the configured timeout.
    pub async fn acquire(&self, seller_id: SellerId) -> Result<CreditLock> {
        let slot = self
            .slots
            .entry(seller_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match tokio::time::timeout(self.acquire_timeout, slot.lock_owned()).await {
            Ok(guard) => {
                self.acquired.fetch_add(1, Ordering::Relaxed);
                Ok(CreditLock {
                    seller_id,
                    acquired_at: Instant::now(),
                    _guard: guard,
                })
            }
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    seller_id = %seller_id,
                    timeout_ms = self.acquire_timeout.as_millis() as u64,
                    "Credit lock acquisition timed out"
                );
                Err(CreditError::ConflictTimeout(format!(
                    "credit lock for seller {seller_id}"
                )))
            }
        }
    }

    /// Check whether a seller's lock is currently held.
    pub fn is_locked(&self, seller_id: &SellerId) -> bool {
        self.slots
            .get(seller_id)
            .map(|slot| slot.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Drop slots nobody holds or waits on.
    pub fn cleanup_idle(&self) {
        self.slots
            .retain(|_, slot| Arc::strong_count(slot) > 1 || slot.try_lock().is_err());
    }

    /// Current statistics.
    pub fn stats(&self) -> LockStats {
        LockStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            slots: self.slots.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_lock_table() -> LockTable {
        LockTable::new(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let table = create_test_lock_table();
        let seller = SellerId::new();

        let lock = table.acquire(seller).await.unwrap();
        assert_eq!(lock.seller_id(), seller);
        assert!(table.is_locked(&seller));

        drop(lock);
        assert!(!table.is_locked(&seller));
        assert!(table.acquire(seller).await.is_ok());
    }

    #[tokio::test]
    async fn test_same_seller_times_out() {
        let table = create_test_lock_table();
        let seller = SellerId::new();

        let _held = table.acquire(seller).await.unwrap();
        let err = table.acquire(seller).await.unwrap_err();

        assert!(matches!(err, CreditError::ConflictTimeout(_)));
        assert_eq!(table.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_other_seller_not_blocked() {
        let table = create_test_lock_table();

        let _held = table.acquire(SellerId::new()).await.unwrap();
        assert!(table.acquire(SellerId::new()).await.is_ok());
        assert_eq!(table.stats().acquired, 2);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_held_slots() {
        let table = create_test_lock_table();
        let held_seller = SellerId::new();

        let _held = table.acquire(held_seller).await.unwrap();
        drop(table.acquire(SellerId::new()).await.unwrap());

        table.cleanup_idle();

        assert_eq!(table.stats().slots, 1);
        assert!(table.is_locked(&held_seller));
    }
}
