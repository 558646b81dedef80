//! Busy-waiting synchronization primitives.
//!
//! These spin instead of parking the thread. They are only suitable for very short critical
//! sections on hosts with real parallel hardware threads; everything else should use
//! `std::sync`. Nothing in this crate uses them by default except to guard the memory
//! monitor's map.

use log::warn;
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;

/// A test-and-test-and-set spinlock protecting a `T`.
pub struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is serialized by `locked`.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held, and `&mut self` makes this the only borrow.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// Outcome of [`SpinBarrier::wait`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BarrierWait {
    /// Both parties arrived.
    Synchronized,
    /// The barrier was interrupted before the other party arrived. No synchronization happened.
    Interrupted,
}

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum BarrierError {
    #[error("a third party tried to wait on a two-party barrier")]
    TooManyParties,
}

/// Rendezvous point for exactly two threads.
///
/// [`interrupt`](Self::interrupt) releases a waiting party early with
/// [`BarrierWait::Interrupted`], and makes later waits return immediately until
/// [`reset`](Self::reset) is called.
#[derive(Debug, Default)]
pub struct SpinBarrier {
    arrived: AtomicUsize,
    generation: AtomicUsize,
    interrupted: AtomicBool,
}

impl SpinBarrier {
    pub const fn new() -> Self {
        Self {
            arrived: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
            interrupted: AtomicBool::new(false),
        }
    }

    /// Spins until the other party arrives or the barrier is interrupted.
    pub fn wait(&self) -> Result<BarrierWait, BarrierError> {
        if self.interrupted.load(Ordering::Acquire) {
            return Ok(BarrierWait::Interrupted);
        }

        let generation = self.generation.load(Ordering::Acquire);
        match self.arrived.fetch_add(1, Ordering::AcqRel) {
            0 => {}
            1 => {
                self.arrived.store(0, Ordering::Release);
                self.generation.fetch_add(1, Ordering::AcqRel);
                return Ok(BarrierWait::Synchronized);
            }
            _ => {
                self.arrived.fetch_sub(1, Ordering::AcqRel);
                warn!("two-party barrier used by a third thread");
                return Err(BarrierError::TooManyParties);
            }
        }

        loop {
            if self.generation.load(Ordering::Acquire) != generation {
                return Ok(BarrierWait::Synchronized);
            }
            if self.interrupted.load(Ordering::Acquire)
                && self
                    .arrived
                    .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return Ok(BarrierWait::Interrupted);
            }
            std::hint::spin_loop();
        }
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Clears a previous interrupt.
    pub fn reset(&self) {
        self.interrupted.store(false, Ordering::Release);
    }
}
