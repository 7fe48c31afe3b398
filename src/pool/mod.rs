//! Fixed-capacity object pools.
//!
//! A [`Pool`] owns `capacity` pre-built objects and hands out [`PoolKey`]s.
//! Keys carry the slot generation, so a key kept after release is detected
//! instead of silently aliasing the next user of the slot.
//!
//! Every slot has its own short mutex and the used counter is atomic, so
//! driver callbacks on other threads can allocate while the core processes.
//!
//! # Example
//!
//! ```
//! use cpc_core::pool::{Pool, PoolKind, Poolable};
//!
//! #[derive(Default)]
//! struct Scratch(Vec<u8>);
//!
//! impl Poolable for Scratch {
//!     fn reset(&mut self) {
//!         self.0.clear();
//!     }
//! }
//!
//! let pool = Pool::new(PoolKind::RxQueueItem, 2, Scratch::default);
//! let key = pool.acquire().unwrap();
//! pool.get(key).unwrap().0.push(1);
//! assert_eq!(pool.used(), 1);
//! pool.release(key).unwrap();
//! assert!(pool.get(key).is_err());
//! ```

mod buffer;

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::{CpcError, Result};

pub use buffer::{
    BufferHandle, BufferPools, Budget, CoreList, DriverList, FreedHandle, HandleKind,
    HeaderBuffer, Payload, RejectBuffer, RxBuffer, RxData, RxDataBuffer, RxQueueItem,
    SecurityTagBuffer,
};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Which pool or budget an allocation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    BufferHandle,
    HeaderBuffer,
    RejectBuffer,
    RxDataBuffer,
    RxQueueItem,
    SupervisoryBudget,
    TxDataBudget,
    SecurityTag,
    CommandContext,
    Endpoint,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolKind::BufferHandle => "buffer handle pool",
            PoolKind::HeaderBuffer => "header buffer pool",
            PoolKind::RejectBuffer => "reject buffer pool",
            PoolKind::RxDataBuffer => "receive data buffer pool",
            PoolKind::RxQueueItem => "receive queue item pool",
            PoolKind::SupervisoryBudget => "supervisory frame budget",
            PoolKind::TxDataBudget => "transmit buffer budget",
            PoolKind::SecurityTag => "security tag pool",
            PoolKind::CommandContext => "system command context pool",
            PoolKind::Endpoint => "endpoint table",
        };
        f.write_str(name)
    }
}

/// Objects that can live in a [`Pool`].
pub trait Poolable: Send {
    /// Called on every acquire, before the key is handed out.
    fn reset(&mut self) {}

    /// Release is refused with `Busy` while this returns false.
    fn is_releasable(&self) -> bool {
        true
    }
}

/// Generation-checked reference to a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    index: u16,
    generation: u16,
}

impl PoolKey {
    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

struct Slot<T> {
    value: T,
    generation: u16,
    in_use: bool,
}

/// Snapshot of one pool's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolUsage {
    pub kind: PoolKind,
    pub used: usize,
    pub capacity: usize,
    pub high_water: usize,
}

/// Fixed-capacity slab of pre-built objects.
pub struct Pool<T> {
    kind: PoolKind,
    slots: Box<[Mutex<Slot<T>>]>,
    free: Mutex<Vec<u16>>,
    used: AtomicUsize,
    high_water: AtomicUsize,
}

impl<T: Poolable> Pool<T> {
    /// Build a pool of `capacity` objects produced by `factory`.
    ///
    /// Capacity is clamped to `u16::MAX` slots.
    pub fn new(kind: PoolKind, capacity: usize, mut factory: impl FnMut() -> T) -> Self {
        let capacity = capacity.min(u16::MAX as usize);
        let slots: Vec<_> = (0..capacity)
            .map(|_| {
                Mutex::new(Slot {
                    value: factory(),
                    generation: 0,
                    in_use: false,
                })
            })
            .collect();
        // Reverse so index 0 is handed out first.
        let free = (0..capacity as u16).rev().collect();
        Self {
            kind,
            slots: slots.into_boxed_slice(),
            free: Mutex::new(free),
            used: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
        }
    }

    /// Take a free slot. The object is reset before the key is returned.
    pub fn acquire(&self) -> Result<PoolKey> {
        let index = lock(&self.free)
            .pop()
            .ok_or(CpcError::ResourceExhausted(self.kind))?;
        let mut slot = lock(&self.slots[index as usize]);
        slot.in_use = true;
        slot.value.reset();
        let key = PoolKey {
            index,
            generation: slot.generation,
        };
        drop(slot);

        let used = self.used.fetch_add(1, Ordering::AcqRel) + 1;
        self.high_water.fetch_max(used, Ordering::AcqRel);
        Ok(key)
    }

    /// Return a slot to the pool.
    pub fn release(&self, key: PoolKey) -> Result<()> {
        let mut slot = self.slot(key)?;
        if !slot.value.is_releasable() {
            return Err(CpcError::Busy);
        }
        slot.in_use = false;
        slot.generation = slot.generation.wrapping_add(1);
        drop(slot);

        lock(&self.free).push(key.index);
        self.used.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// Guarded access to an acquired object.
    pub fn get(&self, key: PoolKey) -> Result<PoolRef<'_, T>> {
        self.slot(key).map(|guard| PoolRef { guard })
    }

    /// Run `f` on an acquired object.
    pub fn with<R>(&self, key: PoolKey, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut slot = self.slot(key)?;
        Ok(f(&mut slot.value))
    }

    /// Whether `key` refers to a currently acquired slot.
    pub fn contains(&self, key: PoolKey) -> bool {
        self.slot(key).is_ok()
    }

    fn slot(&self, key: PoolKey) -> Result<MutexGuard<'_, Slot<T>>> {
        let cell = self
            .slots
            .get(key.index as usize)
            .ok_or(CpcError::InvalidHandle)?;
        let slot = lock(cell);
        if !slot.in_use || slot.generation != key.generation {
            return Err(CpcError::InvalidHandle);
        }
        Ok(slot)
    }

    /// Keys of every acquired slot.
    #[cfg(test)]
    fn acquired_keys(&self) -> Vec<PoolKey> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, cell)| {
                let slot = lock(cell);
                slot.in_use.then_some(PoolKey {
                    index: index as u16,
                    generation: slot.generation,
                })
            })
            .collect()
    }

    #[inline]
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.used())
    }

    /// Highest simultaneous use observed.
    #[inline]
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Acquire)
    }

    pub fn usage(&self) -> PoolUsage {
        PoolUsage {
            kind: self.kind,
            used: self.used(),
            capacity: self.capacity(),
            high_water: self.high_water(),
        }
    }
}

/// Locked access to a pooled object. Holds the slot mutex while alive.
pub struct PoolRef<'a, T> {
    guard: MutexGuard<'a, Slot<T>>,
}

impl<T> Deref for PoolRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard.value
    }
}

impl<T> DerefMut for PoolRef<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard.value
    }
}
