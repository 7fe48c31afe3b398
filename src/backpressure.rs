//! Counting budgets for transmit resources.
//!
//! Transmit data buffers and supervisory frames are not backed by pooled
//! storage (payloads are `Bytes` owned by the caller), but their number is
//! still bounded. A [`BudgetController`] tracks the count with atomics and
//! wakes producers blocked in [`BudgetController::reserve`] when a slot is
//! returned.
//!
//! # Configuration
//!
//! - `capacity`: Maximum simultaneous reservations
//! - Timeout: passed per call to `reserve`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{CpcError, Result};
use crate::pool::PoolKind;

/// Counting budget with async waiting.
///
/// Uses atomic operations for lock-free tracking; can be shared across
/// threads and tasks.
#[derive(Debug)]
pub struct BudgetController {
    kind: PoolKind,
    used: AtomicUsize,
    high_water: AtomicUsize,
    capacity: usize,
    released: Notify,
}

impl BudgetController {
    pub fn new(kind: PoolKind, capacity: usize) -> Self {
        Self {
            kind,
            used: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            capacity,
            released: Notify::new(),
        }
    }

    /// Check if a reservation would succeed right now.
    #[cfg(test)]
    fn can_accept(&self) -> bool {
        self.used.load(Ordering::Acquire) < self.capacity
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.used())
    }

    #[inline]
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Acquire)
    }

    #[inline]
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Try to reserve a slot without blocking.
    ///
    /// Returns `ResourceExhausted(kind)` at capacity.
    pub fn try_reserve(&self) -> Result<()> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.capacity).then_some(current + 1)
            })
            .map(|prev| {
                self.high_water.fetch_max(prev + 1, Ordering::AcqRel);
            })
            .map_err(|_| CpcError::ResourceExhausted(self.kind))
    }

    /// Reserve a slot, waiting up to `timeout` for one to be released.
    pub async fn reserve(&self, timeout: Duration) -> Result<()> {
        // Fast path: try immediate reservation
        if self.try_reserve().is_ok() {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            if self.try_reserve().is_ok() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_reserve().map_err(|_| CpcError::Timeout);
            }
        }
    }

    /// Return a slot and wake one waiting producer.
    ///
    /// Never drops below zero.
    pub fn release(&self) {
        let released = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            })
            .is_ok();
        if released {
            self.released.notify_one();
        }
    }

    /// Forget every reservation (instance teardown).
    pub fn reset(&self) {
        self.used.store(0, Ordering::Release);
        self.released.notify_waiters();
    }
}

/// Guard that releases a budget slot on drop unless disarmed.
pub struct BudgetGuard<'a> {
    budget: &'a BudgetController,
    armed: bool,
}

impl<'a> BudgetGuard<'a> {
    /// Wrap a slot that was already reserved.
    pub fn new(budget: &'a BudgetController) -> Self {
        Self {
            budget,
            armed: true,
        }
    }

    /// Keep the slot; ownership moves to whatever will call `release`.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for BudgetGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.budget.release();
        }
    }
}
