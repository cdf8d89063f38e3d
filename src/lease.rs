//! Per-name mutual exclusion for mirror operations.
//!
//! Every operation that mutates a mirror directory holds the lease for that
//! mirror's name. Operations on different names never contend.

use crate::error::{MirrorError, MirrorResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::debug;

/// Table of per-name locks shared by the engine and the export supervisor
#[derive(Default)]
pub struct LeaseTable {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held for the duration of one operation; released on drop
#[derive(Debug)]
pub struct Lease {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lease for `name`, waiting at most `wait`
    pub async fn acquire(&self, name: &str, wait: Duration) -> MirrorResult<Lease> {
        let lock = self.lock_for(name);

        match timeout(wait, lock.lock_owned()).await {
            Ok(guard) => {
                debug!("Lease acquired: {}", name);
                Ok(Lease {
                    name: name.to_string(),
                    _guard: guard,
                })
            }
            Err(_) => Err(MirrorError::LeaseTimeout {
                name: name.to_string(),
                waited: wait,
            }),
        }
    }

    /// Number of names currently tracked (held or recently used)
    pub fn tracked(&self) -> usize {
        self.table().len()
    }

    fn lock_for(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.table();

        // Entries nobody references any more are idle and can be dropped
        locks.retain(|key, lock| key == name || Arc::strong_count(lock) > 1);

        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_same_name_is_exclusive() {
        let leases = LeaseTable::new();
        let held = leases.acquire("demo", Duration::from_millis(50)).await.unwrap();
        assert_eq!(held.name(), "demo");

        let second = leases.acquire("demo", Duration::from_millis(50)).await;
        assert_matches!(second, Err(MirrorError::LeaseTimeout { ref name, .. }) if name == "demo");

        drop(held);
        let third = leases.acquire("demo", Duration::from_millis(50)).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_distinct_names_do_not_contend() {
        let leases = LeaseTable::new();
        let _a = leases.acquire("alpha", Duration::from_millis(50)).await.unwrap();
        let _b = leases.acquire("beta", Duration::from_millis(50)).await.unwrap();
        assert_eq!(leases.tracked(), 2);
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let leases = Arc::new(LeaseTable::new());
        let held = leases.acquire("demo", Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let leases = leases.clone();
            tokio::spawn(async move { leases.acquire("demo", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        let lease = waiter.await.unwrap();
        assert!(lease.is_ok());
    }

    #[tokio::test]
    async fn test_idle_entries_are_pruned() {
        let leases = LeaseTable::new();
        for name in ["a", "b", "c"] {
            let _lease = leases.acquire(name, Duration::from_millis(50)).await.unwrap();
        }
        let _d = leases.acquire("d", Duration::from_millis(50)).await.unwrap();
        assert_eq!(leases.tracked(), 1);
    }
}
