//! Per-key exponential backoff.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

/// Multiplier applied to the delay on each consecutive failure.
const GROWTH_FACTOR: u32 = 2;

#[derive(Debug, Clone)]
struct Entry {
    attempts: u32,
    delay: Duration,
    last_attempt: Instant,
}

/// Point-in-time view of one backoff entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSnapshot {
    pub attempts: u32,
    pub delay: Duration,
    /// Time left until the key may be retried (zero if already eligible).
    pub remaining: Duration,
}

/// Exponential backoff tracked per key.
///
/// The first failure of a key yields `initial`; every consecutive failure
/// doubles the previous delay up to `max`. Entries that sat idle for longer
/// than twice `max` are treated as fresh.
///
/// Time is read from `tokio::time`, so paused-clock tests drive it directly.
#[derive(Debug, Clone)]
pub struct Backoff<K> {
    initial: Duration,
    max: Duration,
    entries: HashMap<K, Entry>,
}

impl<K: Eq + Hash + Clone> Backoff<K> {
    /// Create a backoff bounded by `initial` and `max`.
    ///
    /// An `initial` larger than `max` is clamped to `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial: initial.min(max),
            max,
            entries: HashMap::new(),
        }
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Record a failed attempt for `key` and return the delay to wait before
    /// the next one.
    pub fn record_failure(&mut self, key: &K) -> Duration {
        let now = Instant::now();
        let stale_after = self.stale_after();

        match self.entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_attempt) <= stale_after => {
                entry.attempts += 1;
                entry.delay = entry.delay.saturating_mul(GROWTH_FACTOR).min(self.max);
                entry.last_attempt = now;
                entry.delay
            }
            _ => {
                self.entries.insert(
                    key.clone(),
                    Entry {
                        attempts: 1,
                        delay: self.initial,
                        last_attempt: now,
                    },
                );
                self.initial
            }
        }
    }

    /// Earliest instant at which `key` may be retried, if it is backing off.
    pub fn next_eligible(&self, key: &K) -> Option<Instant> {
        self.entries
            .get(key)
            .map(|entry| entry.last_attempt + entry.delay)
    }

    /// Number of consecutive failures recorded for `key`.
    pub fn attempts(&self, key: &K) -> u32 {
        self.entries.get(key).map_or(0, |entry| entry.attempts)
    }

    /// Forget `key` (success or removal).
    pub fn clear(&mut self, key: &K) {
        self.entries.remove(key);
    }

    /// Drop entries that have been idle long enough to count as fresh.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let stale_after = self.stale_after();
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_attempt) <= stale_after);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of every tracked key, for introspection.
    pub fn snapshot(&self) -> Vec<(K, BackoffSnapshot)> {
        let now = Instant::now();
        self.entries
            .iter()
            .map(|(key, entry)| {
                let eligible = entry.last_attempt + entry.delay;
                (
                    key.clone(),
                    BackoffSnapshot {
                        attempts: entry.attempts,
                        delay: entry.delay,
                        remaining: eligible.saturating_duration_since(now),
                    },
                )
            })
            .collect()
    }

    fn stale_after(&self) -> Duration {
        self.max.saturating_mul(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn backoff() -> Backoff<String> {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(8))
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_doubles_and_caps() {
        let mut bo = backoff();
        let key = "default/web".to_string();

        let delays: Vec<_> = (0..6).map(|_| bo.record_failure(&key)).collect();
        assert_eq!(
            delays,
            vec![1, 2, 4, 8, 8, 8]
                .into_iter()
                .map(Duration::from_secs)
                .collect::<Vec<_>>()
        );
        assert_eq!(bo.attempts(&key), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_resets_to_initial() {
        let mut bo = backoff();
        let key = "default/web".to_string();

        bo.record_failure(&key);
        bo.record_failure(&key);
        bo.clear(&key);

        assert_eq!(bo.attempts(&key), 0);
        assert_eq!(bo.record_failure(&key), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_eligible_tracks_delay() {
        let mut bo = backoff();
        let key = "default/web".to_string();
        assert!(bo.next_eligible(&key).is_none());

        let start = Instant::now();
        bo.record_failure(&key);
        bo.record_failure(&key);
        assert_eq!(bo.next_eligible(&key), Some(start + Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_restarts() {
        let mut bo = backoff();
        let key = "default/web".to_string();

        bo.record_failure(&key);
        bo.record_failure(&key);
        tokio::time::advance(Duration::from_secs(17)).await;

        assert_eq!(bo.record_failure(&key), Duration::from_secs(1));
        assert_eq!(bo.attempts(&key), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_drops_idle_entries() {
        let mut bo = backoff();
        bo.record_failure(&"a".to_string());
        tokio::time::advance(Duration::from_secs(10)).await;
        bo.record_failure(&"b".to_string());
        tokio::time::advance(Duration::from_secs(7)).await;

        bo.gc();
        assert_eq!(bo.len(), 1);
        assert_eq!(bo.attempts(&"b".to_string()), 1);
    }

    #[test]
    fn test_initial_clamped_to_max() {
        let bo: Backoff<String> = Backoff::new(Duration::from_secs(10), Duration::from_secs(3));
        assert_eq!(bo.initial(), Duration::from_secs(3));
    }

    proptest! {
        #[test]
        fn delays_are_monotonic_and_bounded(
            initial_ms in 1u64..5_000,
            max_ms in 1u64..120_000,
            failures in 1usize..40,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            rt.block_on(async {
                let max = Duration::from_millis(max_ms);
                let mut bo = Backoff::new(Duration::from_millis(initial_ms), max);
                let key = 7u32;
                let mut previous = Duration::ZERO;
                for _ in 0..failures {
                    let delay = bo.record_failure(&key);
                    prop_assert!(delay >= previous);
                    prop_assert!(delay <= max);
                    previous = delay;
                }
                bo.clear(&key);
                prop_assert_eq!(bo.record_failure(&key), bo.initial());
                Ok(())
            })?;
        }
    }
}
