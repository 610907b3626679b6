use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use libp2p::PeerId;
use tokio::time::Instant;

/// Serializes fetcher actions against a single peer. The handle carries the
/// time it was last handed out, so abandoned entries can be aged out.
pub struct PeerLock {
    lock: tokio::sync::Mutex<()>,
    accessed: Mutex<Instant>,
}

impl PeerLock {
    fn new() -> Self {
        PeerLock {
            lock: tokio::sync::Mutex::new(()),
            accessed: Mutex::new(Instant::now()),
        }
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    pub fn accessed(&self) -> Instant {
        *self.accessed.lock().unwrap()
    }

    fn touch(&self) {
        *self.accessed.lock().unwrap() = Instant::now();
    }
}

/// Per-peer locks, created lazily on first use. Returning the handle without
/// locking it lets distinct peers proceed in parallel while the caller
/// serializes its own critical section for one peer.
#[derive(Default)]
pub struct PeerLockTable {
    locks: Mutex<HashMap<PeerId, Arc<PeerLock>>>,
}

impl PeerLockTable {
    /// Returns the lock for `peer`, creating it if absent, and refreshes its
    /// access time.
    pub fn acquire(&self, peer: PeerId) -> Arc<PeerLock> {
        let mut locks = self.locks.lock().unwrap();
        let lock = locks
            .entry(peer)
            .or_insert_with(|| Arc::new(PeerLock::new()));
        lock.touch();
        lock.clone()
    }

    /// Removes entries untouched for longer than `max_age`. An entry whose
    /// mutex cannot be taken is mid-request and is left for a later sweep.
    pub fn sweep(&self, max_age: Duration) {
        let mut locks = self.locks.lock().unwrap();
        locks.retain(|_, lock| {
            if lock.accessed().elapsed() < max_age {
                return true;
            }
            match lock.lock.try_lock() {
                Ok(_guard) => false,
                Err(_) => true,
            }
        });
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn acquire_creates_and_refreshes() {
        let table = PeerLockTable::default();
        let peer = PeerId::random();

        let lock = table.acquire(peer);
        let created = lock.accessed();
        assert_eq!(table.len(), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        let lock = table.acquire(peer);
        assert!(lock.accessed() > created);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_stale_entries() {
        let table = PeerLockTable::default();
        let stale = PeerId::random();
        let fresh = PeerId::random();

        table.acquire(stale);
        tokio::time::advance(Duration::from_secs(61 * 60)).await;
        table.acquire(fresh);

        table.sweep(Duration::from_secs(60 * 60));
        assert_eq!(table.len(), 1);
        assert_eq!(table.acquire(fresh).accessed(), Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_skips_entry_in_critical_section() {
        let table = PeerLockTable::default();
        let peer = PeerId::random();

        let lock = table.acquire(peer);
        let guard = lock.lock().await;
        tokio::time::advance(Duration::from_secs(61 * 60)).await;

        table.sweep(Duration::from_secs(60 * 60));
        assert_eq!(table.len(), 1);

        drop(guard);
        table.sweep(Duration::from_secs(60 * 60));
        assert_eq!(table.len(), 0);
    }
}
