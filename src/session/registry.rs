//! Session registry
//!
//! Connection counting and server-wide transfer statistics. These are the
//! only values shared between sessions, so everything here is atomic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use log::debug;

/// Server-wide counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    sessions_total: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    transfers_completed: AtomicU64,
    transfers_failed: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub sessions_total: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub transfers_completed: u64,
    pub transfers_failed: u64,
}

impl ServerStats {
    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_total: self.sessions_total.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
        }
    }
}

/// Tracks live control connections against the configured limit.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    active: AtomicUsize,
    next_id: AtomicU64,
    stats: ServerStats,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserves a slot if fewer than `limit` sessions are active.
    pub fn try_acquire(self: &Arc<Self>, limit: usize) -> Option<SessionGuard> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.stats.sessions_total.fetch_add(1, Ordering::Relaxed);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Some(SessionGuard {
            registry: Arc::clone(self),
            id,
            released: AtomicBool::new(false),
        })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

/// Slot held by one session; the count is given back exactly once.
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: u64,
    released: AtomicBool,
}

impl SessionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Gives the slot back. Later calls, and the drop, are no-ops.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            debug!("Session {} slot already released", self.id);
            return;
        }
        self.registry.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_enforced() {
        let registry = SessionRegistry::new();
        let a = registry.try_acquire(1);
        assert!(a.is_some());
        assert!(registry.try_acquire(1).is_none());
        drop(a);
        assert!(registry.try_acquire(1).is_some());
    }

    #[test]
    fn double_release_does_not_double_decrement() {
        let registry = SessionRegistry::new();
        let first = registry.try_acquire(4).unwrap();
        let _second = registry.try_acquire(4).unwrap();
        assert_eq!(registry.active(), 2);

        first.release();
        first.release();
        drop(first);
        assert_eq!(registry.active(), 1);
    }

    #[test]
    fn stats_accumulate() {
        let registry = SessionRegistry::new();
        registry.stats().record_sent(10);
        registry.stats().record_received(5);
        registry.stats().record_failure();
        let snap = registry.stats().snapshot();
        assert_eq!(snap.bytes_sent, 10);
        assert_eq!(snap.bytes_received, 5);
        assert_eq!(snap.transfers_completed, 2);
        assert_eq!(snap.transfers_failed, 1);
    }
}
