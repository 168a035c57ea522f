//! Per-subvolume sessions.
//!
//! Only one connection at a time may negotiate or receive for a given
//! subvolume. Sessions for different subvolumes never wait on each other.
//! A subvolume's entry lives only while some connection holds or awaits it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = HashMap<String, Arc<Mutex<()>>>;

#[derive(Default)]
pub struct SessionRegistry {
    // Never held across an await.
    locks: Arc<StdMutex<LockMap>>,
}

/// Exclusive claim on one subvolume, released on drop.
pub struct SessionGuard {
    subvolume: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<StdMutex<LockMap>>,
}

impl SessionGuard {
    pub fn subvolume(&self) -> &str {
        &self.subvolume
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut locks = lock_map(&self.locks);
        self.guard.take();
        // Left: the map's reference and ours. Waiters clone under the map
        // lock, so nobody can be about to pick this entry up.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.subvolume);
        }
    }
}

fn lock_map(locks: &StdMutex<LockMap>) -> MutexGuard<'_, LockMap> {
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subvolumes currently held or awaited.
    pub fn active(&self) -> usize {
        lock_map(&self.locks).len()
    }

    /// Claim `subvolume`, waiting for any other session holding it.
    pub async fn acquire(&self, subvolume: &str) -> SessionGuard {
        let lock = lock_map(&self.locks)
            .entry(subvolume.to_string())
            .or_default()
            .clone();

        let guard = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::info!(subvolume, "Waiting for another session on this subvolume");
                lock.clone().lock_owned().await
            }
        };

        SessionGuard {
            subvolume: subvolume.to_string(),
            lock,
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_subvolume_is_serialized() {
        let registry = Arc::new(SessionRegistry::new());
        let first = registry.acquire("home").await;

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.acquire("home").await.subvolume().to_string() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let name = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, "home");
    }

    #[tokio::test]
    async fn test_different_subvolumes_do_not_block() {
        let registry = SessionRegistry::new();
        let _home = registry.acquire("home").await;
        let var = tokio::time::timeout(Duration::from_secs(1), registry.acquire("var"))
            .await
            .unwrap();
        assert_eq!(var.subvolume(), "var");
        assert_eq!(registry.active(), 2);
    }

    #[tokio::test]
    async fn test_entries_removed_when_released() {
        let registry = Arc::new(SessionRegistry::new());
        for name in ["a", "b", "c"] {
            drop(registry.acquire(name).await);
        }
        assert_eq!(registry.active(), 0);

        // An entry with a waiter survives the holder's release.
        let first = registry.acquire("home").await;
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _guard = registry.acquire("home").await;
                registry.active()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(first);
        let while_held = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(while_held, 1);
        assert_eq!(registry.active(), 0);
    }
}
