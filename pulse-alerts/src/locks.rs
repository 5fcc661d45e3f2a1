//! Per-`(rule, customer)` locks around match processing.

use dashmap::DashMap;
use pulse_core::{AlertRuleId, CustomerId};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub type MatchKey = (AlertRuleId, CustomerId);

/// Serializes the cooldown check and the history insert of one pair
/// across the periodic pass and the post-score hook.
#[derive(Debug, Default)]
pub struct MatchLocks {
    locks: DashMap<MatchKey, Arc<Mutex<()>>>,
}

impl MatchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock on `key`.
    pub async fn acquire(&self, key: MatchKey) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(key).or_default().clone();
        lock.lock_owned().await
    }

    /// Drop the entry for `key` once nobody holds or waits on it.
    pub fn release(&self, key: MatchKey) {
        self.locks.remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_caller_waits_for_the_first() {
        let locks = Arc::new(MatchLocks::new());
        let key = (AlertRuleId::now_v7(), CustomerId::now_v7());
        let guard = locks.acquire(key).await;

        let waiting = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(key).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        // Other pairs are independent.
        drop(locks.acquire((key.0, CustomerId::now_v7())).await);

        drop(guard);
        waiting.await.unwrap();
        locks.release(key);
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_release_keeps_held_entries() {
        let locks = MatchLocks::new();
        let key = (AlertRuleId::now_v7(), CustomerId::now_v7());
        let guard = locks.acquire(key).await;
        locks.release(key);
        assert_eq!(locks.len(), 1);
        drop(guard);
        locks.release(key);
        assert!(locks.is_empty());
    }
}
