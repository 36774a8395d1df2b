//! Per-digest mutual exclusion.
//!
//! Two requests carrying the same input must not both run the converter.
//! The coordinator takes a [`KeyedLock`] guard for the input digest before
//! its cache check and holds it until the insert is done, so the second
//! request waits and then finds the first one's record. Requests for
//! different digests never contend.
//!
//! Entries are removed when the last holder or waiter lets go, so the map
//! only ever contains digests that are in flight.

use crate::fingerprint::Digest;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// One digest's mutex plus the number of tasks holding or awaiting it.
#[derive(Debug, Default)]
struct Slot {
    mutex: Arc<tokio::sync::Mutex<()>>,
    users: usize,
}

type Slots = Arc<Mutex<HashMap<Digest, Slot>>>;

/// A set of async mutexes keyed by [`Digest`].
#[derive(Debug, Default)]
pub struct KeyedLock {
    slots: Slots,
}

/// A registered interest in `key`. Taken before waiting, so a waiter that
/// is cancelled mid-wait still unregisters.
#[derive(Debug)]
struct Lease {
    key: Digest,
    slots: Slots,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.users -= 1;
            if slot.users == 0 {
                slots.remove(&self.key);
            }
        }
    }
}

/// Held while a digest is being processed. Dropping it releases the digest.
#[derive(Debug)]
pub struct KeyedGuard {
    // Field order matters: the mutex is released before the lease is.
    _guard: OwnedMutexGuard<()>,
    _lease: Lease,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other task holds `key`, then hold it.
    pub async fn lock(&self, key: Digest) -> KeyedGuard {
        let mutex = {
            let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            let slot = slots.entry(key).or_default();
            slot.users += 1;
            Arc::clone(&slot.mutex)
        };
        let lease = Lease {
            key,
            slots: Arc::clone(&self.slots),
        };
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            _guard: guard,
            _lease: lease,
        }
    }

    /// Number of digests currently held or awaited.
    pub fn in_flight(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::digest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let lock = Arc::new(KeyedLock::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let key = digest(b"same");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let (lock, active, peak) = (lock.clone(), active.clone(), peak.clone());
            handles.push(tokio::spawn(async move {
                let _g = lock.lock(key).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(lock.in_flight(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let lock = KeyedLock::new();
        let _a = lock.lock(digest(b"a")).await;
        let b =
            tokio::time::timeout(Duration::from_millis(100), lock.lock(digest(b"b"))).await;
        assert!(b.is_ok());
        assert_eq!(lock.in_flight(), 2);
    }

    #[tokio::test]
    async fn entry_is_removed_after_release() {
        let lock = KeyedLock::new();
        {
            let _g = lock.lock(digest(b"x")).await;
            assert_eq!(lock.in_flight(), 1);
        }
        assert_eq!(lock.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_no_entry() {
        let lock = KeyedLock::new();
        let key = digest(b"contended");

        let holder = lock.lock(key).await;
        let mut waiter = tokio_test::task::spawn(lock.lock(key));
        tokio_test::assert_pending!(waiter.poll());

        // Release while the waiter is still queued, then abandon the waiter.
        drop(holder);
        drop(waiter);
        assert_eq!(lock.in_flight(), 0);

        // The digest is usable again afterwards.
        let again = tokio::time::timeout(Duration::from_millis(100), lock.lock(key)).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn timed_out_waiter_leaves_no_entry() {
        let lock = KeyedLock::new();
        let key = digest(b"contended");

        let holder = lock.lock(key).await;
        let waited = tokio::time::timeout(Duration::from_millis(20), lock.lock(key)).await;
        assert!(waited.is_err());
        assert_eq!(lock.in_flight(), 1);

        drop(holder);
        assert_eq!(lock.in_flight(), 0);
    }
}
