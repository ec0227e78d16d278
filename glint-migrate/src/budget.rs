//! Shared memory budget.
//!
//! Every collection worker reserves an estimate before fetching a batch and
//! holds the permit until the batch is written. When a reservation would push
//! usage over the ceiling the worker waits for in-flight batches (of any
//! collection) to flush. A reservation is always granted when nothing else is
//! in flight, so a single oversized batch cannot deadlock the run.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{MigrateResult, MigrationError};

#[derive(Debug, Default)]
struct BudgetState {
    in_use: usize,
    in_flight: usize,
    peak: usize,
    throttle_events: u64,
}

/// Memory ceiling shared by all collection workers.
#[derive(Debug)]
pub struct MemoryBudget {
    ceiling: usize,
    state: Mutex<BudgetState>,
    released: Notify,
}

impl MemoryBudget {
    /// Create a budget with a ceiling in bytes.
    pub fn new(ceiling: usize) -> Arc<Self> {
        Arc::new(Self {
            ceiling,
            state: Mutex::new(BudgetState::default()),
            released: Notify::new(),
        })
    }

    /// Ceiling in bytes.
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Bytes currently reserved.
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    /// Highest reservation total observed.
    pub fn peak(&self) -> usize {
        self.state.lock().peak
    }

    /// Number of reservations that had to wait.
    pub fn throttle_events(&self) -> u64 {
        self.state.lock().throttle_events
    }

    /// Reserve `bytes`, waiting while the ceiling would be exceeded.
    pub async fn acquire(
        self: &Arc<Self>,
        bytes: usize,
        cancel: &CancellationToken,
    ) -> MigrateResult<MemoryPermit> {
        let mut throttled = false;
        loop {
            let notified = self.released.notified();
            {
                let mut state = self.state.lock();
                if state.in_flight == 0 || state.in_use.saturating_add(bytes) <= self.ceiling {
                    state.in_use += bytes;
                    state.in_flight += 1;
                    state.peak = state.peak.max(state.in_use);
                    return Ok(MemoryPermit {
                        budget: Arc::clone(self),
                        bytes,
                    });
                }
                if !throttled {
                    throttled = true;
                    state.throttle_events += 1;
                    debug!(
                        requested = bytes,
                        in_use = state.in_use,
                        ceiling = self.ceiling,
                        "Memory ceiling reached, waiting for in-flight batches"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(MigrationError::Cancelled),
                _ = notified => {}
            }
        }
    }
}

/// A reservation against a [`MemoryBudget`]. Released on drop.
#[derive(Debug)]
pub struct MemoryPermit {
    budget: Arc<MemoryBudget>,
    bytes: usize,
}

impl MemoryPermit {
    /// Bytes held by this permit.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Replace the estimate with the measured size of the batch.
    pub fn resize(&mut self, bytes: usize) {
        let shrunk = {
            let mut state = self.budget.state.lock();
            state.in_use = state.in_use - self.bytes + bytes;
            state.peak = state.peak.max(state.in_use);
            bytes < self.bytes
        };
        self.bytes = bytes;
        if shrunk {
            self.budget.released.notify_waiters();
        }
    }
}

impl Drop for MemoryPermit {
    fn drop(&mut self) {
        {
            let mut state = self.budget.state.lock();
            state.in_use -= self.bytes;
            state.in_flight -= 1;
        }
        self.budget.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_within_ceiling() {
        let budget = MemoryBudget::new(1000);
        let cancel = CancellationToken::new();

        let a = budget.acquire(400, &cancel).await.unwrap();
        let b = budget.acquire(500, &cancel).await.unwrap();
        assert_eq!(budget.in_use(), 900);
        drop(a);
        drop(b);
        assert_eq!(budget.in_use(), 0);
        assert_eq!(budget.peak(), 900);
        assert_eq!(budget.throttle_events(), 0);
    }

    #[tokio::test]
    async fn test_oversized_allowed_when_idle() {
        let budget = MemoryBudget::new(100);
        let cancel = CancellationToken::new();
        let permit = budget.acquire(5000, &cancel).await.unwrap();
        assert_eq!(permit.bytes(), 5000);
    }

    #[tokio::test]
    async fn test_throttles_until_release() {
        let budget = MemoryBudget::new(1000);
        let cancel = CancellationToken::new();

        let held = budget.acquire(800, &cancel).await.unwrap();

        let waiter = {
            let budget = Arc::clone(&budget);
            let cancel = cancel.clone();
            tokio::spawn(async move { budget.acquire(500, &cancel).await.map(|p| p.bytes()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(budget.throttle_events(), 1);

        drop(held);
        let bytes = waiter.await.unwrap().unwrap();
        assert_eq!(bytes, 500);
        assert!(budget.peak() <= 1000);
    }

    #[tokio::test]
    async fn test_resize_adjusts_usage() {
        let budget = MemoryBudget::new(1000);
        let cancel = CancellationToken::new();
        let mut permit = budget.acquire(300, &cancel).await.unwrap();
        permit.resize(120);
        assert_eq!(budget.in_use(), 120);
        permit.resize(700);
        assert_eq!(budget.in_use(), 700);
        assert_eq!(budget.peak(), 700);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let budget = MemoryBudget::new(100);
        let cancel = CancellationToken::new();
        let _held = budget.acquire(100, &cancel).await.unwrap();

        cancel.cancel();
        let err = budget.acquire(50, &cancel).await.unwrap_err();
        assert!(matches!(err, MigrationError::Cancelled));
    }
}
