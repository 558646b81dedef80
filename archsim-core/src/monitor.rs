//! Load-linked / store-conditional bookkeeping.
//!
//! A monitor remembers, per guest thread, the address of its last load-linked. Any write to that
//! address by another thread clears the entry, so the owner's store-conditional fails.

use crate::memory::MemoryResult;
use crate::sync::SpinLock;
use crate::thread::GuestThreadId;
use crate::Address;
use log::{trace, warn};
use nohash::IntMap;
use std::fmt;
use std::sync::{Condvar, Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum MonitorError {
    #[error("thread {0} released a monitor section it does not hold")]
    NotHeld(GuestThreadId),
}

/// Coordinates LL/SC between guest threads.
///
/// All calls for a given load/store must be made in program order relative to the memory access
/// they guard. The monitor does not order other memory effects.
pub trait MemoryMonitor: Send + Sync + fmt::Debug {
    /// Records `address` as the monitored address of `thread`, replacing any previous one.
    fn acquire_monitor(&self, thread: GuestThreadId, address: Address);

    /// Enters the monitor's exclusive section. Returns `true`, with the section still held, if
    /// `thread` still monitors `address`. Otherwise leaves the section and returns `false`.
    fn lock_monitor(&self, thread: GuestThreadId, address: Address) -> bool;

    /// Leaves the section entered by a successful [`lock_monitor`](Self::lock_monitor).
    fn unlock_monitor(&self, thread: GuestThreadId, address: Address) -> Result<(), MonitorError>;

    /// Called on every write: clears the entries of other threads that monitor `address`.
    fn notify(&self, thread: GuestThreadId, address: Address);

    /// Performs a plain write by `thread` to `address` as one step inside the exclusive section:
    /// [`notify`](Self::notify), then `write`. No load-linked of another thread can observe the
    /// address between the two.
    fn exclusive_write(
        &self,
        thread: GuestThreadId,
        address: Address,
        write: &mut dyn FnMut() -> MemoryResult,
    ) -> MemoryResult;

    /// Drops the monitor held by `thread`, if any.
    fn clear_monitor(&self, thread: GuestThreadId);

    /// The address `thread` currently monitors.
    fn monitored_address(&self, thread: GuestThreadId) -> Option<Address>;
}

#[derive(Debug, Default)]
struct SectionState {
    owner: Option<GuestThreadId>,
    depth: usize,
}

/// A mutual-exclusion section that the holding guest thread may re-enter.
///
/// Ownership is tracked by guest thread id, not by OS thread.
#[derive(Debug, Default)]
struct RecursiveSection {
    state: Mutex<SectionState>,
    released: Condvar,
}

impl RecursiveSection {
    fn enter(&self, thread: GuestThreadId) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while state.owner.is_some_and(|owner| owner != thread) {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.owner = Some(thread);
        state.depth += 1;
    }

    fn exit(&self, thread: GuestThreadId) -> Result<(), MonitorError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.owner != Some(thread) {
            return Err(MonitorError::NotHeld(thread));
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.released.notify_one();
        }
        Ok(())
    }

    fn depth(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .depth
    }
}

/// The default [`MemoryMonitor`]: exact-address matching, one entry per thread.
///
/// Every operation runs inside one recursive section, so a thread holding the section after a
/// successful [`lock_monitor`](MemoryMonitor::lock_monitor) can still call
/// [`notify`](MemoryMonitor::notify) and [`acquire_monitor`](MemoryMonitor::acquire_monitor)
/// without deadlocking. Each nested call enters and leaves the section once, so only the final
/// [`unlock_monitor`](MemoryMonitor::unlock_monitor) releases it.
#[derive(Debug, Default)]
pub struct BaseMemoryMonitor {
    section: RecursiveSection,
    monitors: SpinLock<IntMap<GuestThreadId, Address>>,
}

impl BaseMemoryMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_section<R>(&self, thread: GuestThreadId, f: impl FnOnce() -> R) -> R {
        self.section.enter(thread);
        let result = f();
        // Cannot fail: `enter` just made `thread` the owner.
        let _ = self.section.exit(thread);
        result
    }
}

impl MemoryMonitor for BaseMemoryMonitor {
    fn acquire_monitor(&self, thread: GuestThreadId, address: Address) {
        self.with_section(thread, || {
            trace!("thread {thread} monitors {address}");
            self.monitors.lock().insert(thread, address);
        });
    }

    fn lock_monitor(&self, thread: GuestThreadId, address: Address) -> bool {
        self.section.enter(thread);
        let held = self.monitors.lock().get(&thread) == Some(&address);
        if !held {
            let _ = self.section.exit(thread);
        }
        held
    }

    fn unlock_monitor(&self, thread: GuestThreadId, address: Address) -> Result<(), MonitorError> {
        self.section.exit(thread).map_err(|e| {
            warn!("thread {thread} unlocked monitor on {address} without holding it");
            e
        })
    }

    fn notify(&self, thread: GuestThreadId, address: Address) {
        self.with_section(thread, || {
            self.monitors.lock().retain(|&owner, &mut monitored| {
                let keep = owner == thread || monitored != address;
                if !keep {
                    trace!("write by thread {thread} to {address} clears monitor of thread {owner}");
                }
                keep
            });
        });
    }

    fn exclusive_write(
        &self,
        thread: GuestThreadId,
        address: Address,
        write: &mut dyn FnMut() -> MemoryResult,
    ) -> MemoryResult {
        self.with_section(thread, || {
            self.notify(thread, address);
            write()
        })
    }

    fn clear_monitor(&self, thread: GuestThreadId) {
        self.with_section(thread, || {
            self.monitors.lock().remove(&thread);
        });
    }

    fn monitored_address(&self, thread: GuestThreadId) -> Option<Address> {
        self.monitors.lock().get(&thread).copied()
    }
}
