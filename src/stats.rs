use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use scopeguard::ScopeGuard;

/// Counters shared by the listener and its sessions.
#[derive(Debug, Default)]
pub struct BridgeStats {
    active_sessions: AtomicU64,
    total_sessions: AtomicU64,
    failed_sessions: AtomicU64,
    bytes_to_upstream: AtomicU64,
    bytes_to_client: AtomicU64,
}

/// Point-in-time copy of [`BridgeStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub active_sessions: u64,
    pub total_sessions: u64,
    pub failed_sessions: u64,
    pub bytes_to_upstream: u64,
    pub bytes_to_client: u64,
}

impl BridgeStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count a new session as active until the returned guard drops.
    ///
    /// The guard runs on every exit path, including task abort, so the
    /// active count always returns to zero once the sessions are gone.
    pub fn session_started(self: &Arc<Self>) -> ScopeGuard<Arc<Self>, impl FnOnce(Arc<Self>)> {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        scopeguard::guard(Arc::clone(self), |stats| {
            stats.active_sessions.fetch_sub(1, Ordering::Relaxed);
        })
    }

    pub fn session_failed(&self) {
        self.failed_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_transfer(&self, to_upstream: u64, to_client: u64) {
        self.bytes_to_upstream.fetch_add(to_upstream, Ordering::Relaxed);
        self.bytes_to_client.fetch_add(to_client, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            failed_sessions: self.failed_sessions.load(Ordering::Relaxed),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_releases_active_session() {
        let stats = BridgeStats::new();
        {
            let _a = stats.session_started();
            let _b = stats.session_started();
            assert_eq!(stats.snapshot().active_sessions, 2);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.active_sessions, 0);
        assert_eq!(snap.total_sessions, 2);
    }

    #[test]
    fn test_transfer_totals_accumulate() {
        let stats = BridgeStats::new();
        stats.add_transfer(10, 20);
        stats.add_transfer(1, 2);
        stats.session_failed();
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_to_upstream, 11);
        assert_eq!(snap.bytes_to_client, 22);
        assert_eq!(snap.failed_sessions, 1);
    }
}
