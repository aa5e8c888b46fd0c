use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port in {start}..{end} ({leased} leased)")]
    Exhausted { start: u16, end: u16, leased: usize },
    #[error("cancelled while waiting for a port")]
    Cancelled,
}

struct PoolState {
    free: Vec<u16>,
    leased: HashSet<u16>,
}

/// Hands out exclusive leases over the loopback port range.
///
/// A port is leased before the child process tries to bind it, so a
/// lease only guarantees that no other test task holds the same
/// number. Bind failures surface later as a per-task outcome and the
/// lease goes back to the pool.
pub struct PortManager {
    start: u16,
    end: u16,
    state: Mutex<PoolState>,
    returned: Notify,
}

impl PortManager {
    /// Pool over `[start, end)`. The range must be non-empty.
    pub fn new(start: u16, end: u16) -> Self {
        debug_assert!(start < end, "empty port range");
        PortManager {
            start,
            end,
            state: Mutex::new(PoolState {
                free: (start..end).rev().collect(),
                leased: HashSet::new(),
            }),
            returned: Notify::new(),
        }
    }

    /// Lease any free port, or fail immediately when the range is used up.
    pub fn acquire(self: &Arc<Self>) -> Result<PortLease, PortError> {
        let mut state = self.state.lock().unwrap();
        match state.free.pop() {
            Some(port) => {
                state.leased.insert(port);
                Ok(PortLease {
                    port,
                    manager: Arc::clone(self),
                    released: false,
                })
            }
            None => Err(PortError::Exhausted {
                start: self.start,
                end: self.end,
                leased: state.leased.len(),
            }),
        }
    }

    /// Lease a port, waiting for releases until `wait` elapses or
    /// `cancel` fires. Under a fully leased range this serializes
    /// acquirers on the release notifications.
    pub async fn acquire_within(
        self: &Arc<Self>,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<PortLease, PortError> {
        let deadline = Instant::now() + wait;
        loop {
            match self.acquire() {
                Ok(lease) => return Ok(lease),
                Err(PortError::Cancelled) => unreachable!(),
                Err(exhausted) => {
                    tokio::select! {
                        _ = self.returned.notified() => {}
                        _ = cancel.cancelled() => return Err(PortError::Cancelled),
                        _ = tokio::time::sleep_until(deadline) => return Err(exhausted),
                    }
                }
            }
        }
    }

    /// Number of leases currently outstanding.
    pub fn outstanding(&self) -> usize {
        self.state.lock().unwrap().leased.len()
    }

    /// Reset the pool, invalidating every outstanding lease. Their
    /// later releases become no-ops.
    pub fn release_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.leased.clear();
        state.free = (self.start..self.end).rev().collect();
        drop(state);
        self.returned.notify_waiters();
    }

    fn release_port(&self, port: u16) {
        let mut state = self.state.lock().unwrap();
        // Unknown or already released ports are ignored.
        if state.leased.remove(&port) {
            state.free.push(port);
            drop(state);
            // One release frees exactly one port, so wake one waiter.
            self.returned.notify_one();
        }
    }
}

impl std::fmt::Debug for PortManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortManager")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Exclusive claim on one port number, returned to the pool on
/// `release` or drop, whichever comes first.
pub struct PortLease {
    port: u16,
    manager: Arc<PortManager>,
    released: bool,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Idempotent; the lease can also just be dropped.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.manager.release_port(self.port);
        }
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for PortLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLease").field("port", &self.port).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_unique_ports() {
        let mgr = Arc::new(PortManager::new(20000, 20004));
        let leases: Vec<_> = (0..4).map(|_| mgr.acquire().unwrap()).collect();
        let unique: HashSet<u16> = leases.iter().map(|l| l.port()).collect();
        assert_eq!(unique.len(), 4);
        assert_eq!(mgr.outstanding(), 4);
        assert!(matches!(
            mgr.acquire(),
            Err(PortError::Exhausted { leased: 4, .. })
        ));
    }

    #[test]
    fn test_release_returns_port_to_pool() {
        let mgr = Arc::new(PortManager::new(20000, 20001));
        let mut lease = mgr.acquire().unwrap();
        assert_eq!(lease.port(), 20000);
        lease.release();
        assert_eq!(mgr.outstanding(), 0);
        let again = mgr.acquire().unwrap();
        assert_eq!(again.port(), 20000);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mgr = Arc::new(PortManager::new(20000, 20002));
        let mut a = mgr.acquire().unwrap();
        a.release();
        // The freed number gets leased again. Releasing the stale
        // lease a second time must not free it underneath the new owner.
        let b = mgr.acquire().unwrap();
        assert_eq!(b.port(), 20000);
        a.release();
        drop(a);
        assert_eq!(mgr.outstanding(), 1);
    }

    #[test]
    fn test_drop_releases() {
        let mgr = Arc::new(PortManager::new(20000, 20001));
        {
            let _lease = mgr.acquire().unwrap();
            assert_eq!(mgr.outstanding(), 1);
        }
        assert_eq!(mgr.outstanding(), 0);
    }

    #[test]
    fn test_release_all_resets() {
        let mgr = Arc::new(PortManager::new(20000, 20010));
        let leases: Vec<_> = (0..5).map(|_| mgr.acquire().unwrap()).collect();
        mgr.release_all();
        assert_eq!(mgr.outstanding(), 0);
        // Stale releases after the reset are no-ops.
        drop(leases);
        assert_eq!(mgr.outstanding(), 0);
        let all: HashSet<u16> = (0..10).map(|_| mgr.acquire().unwrap().port()).collect();
        assert_eq!(all.len(), 10);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_never_doubles() {
        let mgr = Arc::new(PortManager::new(21000, 21032));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let mgr = mgr.clone();
            handles.push(tokio::spawn(async move {
                let lease = mgr.acquire().unwrap();
                let port = lease.port();
                tokio::time::sleep(Duration::from_millis(5)).await;
                port
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }
        assert_eq!(mgr.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_acquire_within_waits_for_release() {
        let mgr = Arc::new(PortManager::new(22000, 22001));
        let mut first = mgr.acquire().unwrap();
        let waiter = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                mgr.acquire_within(Duration::from_secs(5), &cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        first.release();
        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(lease.port(), 22000);
    }

    #[tokio::test]
    async fn test_acquire_within_times_out() {
        let mgr = Arc::new(PortManager::new(22100, 22101));
        let _held = mgr.acquire().unwrap();
        let cancel = CancellationToken::new();
        let err = mgr
            .acquire_within(Duration::from_millis(50), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn test_acquire_within_observes_cancel() {
        let mgr = Arc::new(PortManager::new(22200, 22201));
        let _held = mgr.acquire().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = mgr
            .acquire_within(Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::Cancelled));
    }
}
