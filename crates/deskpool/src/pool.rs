//! Display id and port allocation.
//!
//! The pool hands out (display id, VNC port) pairs from a fixed numeric
//! range. A display id is either free or held by exactly one session; all
//! mutation goes through one mutex so two sessions can never be granted the
//! same X display.

use std::collections::BTreeSet;
use std::sync::Mutex;

use log::{debug, warn};

use crate::error::{SessionError, SessionResult};

/// A display id and its derived VNC port, held by one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayLease {
    pub display: u32,
    pub vnc_port: u16,
}

/// Free/held view of the pool, for rollback-equality checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub free: BTreeSet<u32>,
    pub held: BTreeSet<u32>,
}

struct PoolInner {
    free: BTreeSet<u32>,
    held: BTreeSet<u32>,
}

/// Bounded allocator for display ids `first..first + capacity`.
pub struct DisplayPool {
    first: u32,
    capacity: usize,
    vnc_base_port: u16,
    inner: Mutex<PoolInner>,
}

impl DisplayPool {
    /// # Panics
    ///
    /// Panics when the highest derived port (`vnc_base_port + first +
    /// capacity - 1`) does not fit a u16. Configuration validation rejects
    /// such bounds before a pool is constructed.
    pub fn new(first: u32, capacity: usize, vnc_base_port: u16) -> Self {
        let last_display = first as u64 + capacity.saturating_sub(1) as u64;
        assert!(
            vnc_base_port as u64 + last_display <= u16::MAX as u64,
            "vnc port range overflows u16 (base {}, last display {})",
            vnc_base_port,
            last_display
        );
        Self {
            first,
            capacity,
            vnc_base_port,
            inner: Mutex::new(PoolInner {
                free: (first..first + capacity as u32).collect(),
                held: BTreeSet::new(),
            }),
        }
    }

    /// Acquire the lowest free display id.
    ///
    /// Fails with [`SessionError::Exhausted`] when every id is held. That is
    /// a capacity signal for the caller, not something to retry here.
    pub fn acquire(&self) -> SessionResult<DisplayLease> {
        let mut inner = self.lock();
        let display = match inner.free.iter().next().copied() {
            Some(d) => d,
            None => {
                return Err(SessionError::Exhausted {
                    capacity: self.capacity,
                });
            }
        };
        inner.free.remove(&display);
        inner.held.insert(display);

        let lease = DisplayLease {
            display,
            vnc_port: self.vnc_base_port + display as u16,
        };
        debug!("acquired display :{} (vnc port {})", display, lease.vnc_port);
        Ok(lease)
    }

    /// Return a display id to the pool.
    ///
    /// Idempotent: releasing an already-free id is a no-op so retry-after-
    /// crash paths cannot double-free.
    pub fn release(&self, display: u32) {
        if display < self.first || display >= self.first + self.capacity as u32 {
            warn!("ignoring release of out-of-range display :{}", display);
            return;
        }
        let mut inner = self.lock();
        if inner.held.remove(&display) {
            inner.free.insert(display);
            debug!("released display :{}", display);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        // A poisoned lock only means a panic elsewhere; the bookkeeping
        // itself is still consistent.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Whether a display id is currently held.
    pub fn is_held(&self, display: u32) -> bool {
        self.lock().held.contains(&display)
    }

    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = self.lock();
        PoolSnapshot {
            free: inner.free.clone(),
            held: inner.held.clone(),
        }
    }
}

impl std::fmt::Debug for DisplayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayPool")
            .field("first", &self.first)
            .field("capacity", &self.capacity)
            .field("free", &self.free_count())
            .finish()
    }
}
