// ABOUTME: Token-indexed registry of in-flight work with time-based purge.
// ABOUTME: Tracks outstanding handler tasks and unacknowledged instructions.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::clock::Clock;
use crate::error::ConnectorError;

#[derive(Debug, Clone)]
pub struct TaskCache<T> {
    clock: Clock,
    entries: HashMap<u64, (Instant, T)>,
}

impl<T> TaskCache<T> {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            entries: HashMap::new(),
        }
    }

    pub fn add(&mut self, token: u64, task: T) -> Result<(), ConnectorError> {
        if self.entries.contains_key(&token) {
            return Err(ConnectorError::InvalidArgument(format!(
                "token {token} is already present in the task cache"
            )));
        }
        self.entries.insert(token, (self.clock.now(), task));
        Ok(())
    }

    pub fn try_remove(&mut self, token: u64) -> Option<T> {
        self.entries.remove(&token).map(|(_, task)| task)
    }

    /// Remove and return every entry at least `max_age` old.
    pub fn purge(&mut self, max_age: Duration) -> Vec<T> {
        let now = self.clock.now();
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, (inserted_at, _))| now.saturating_duration_since(*inserted_at) >= max_age)
            .map(|(token, _)| *token)
            .collect();
        expired
            .into_iter()
            .filter_map(|token| self.try_remove(token))
            .collect()
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> Vec<T> {
        self.entries.drain().map(|(_, (_, task))| task).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache() -> (ManualClock, TaskCache<&'static str>) {
        let manual = ManualClock::new(Instant::now());
        let cache = TaskCache::new(manual.clock());
        (manual, cache)
    }

    #[test]
    fn test_add_rejects_duplicate_token() {
        let (_, mut cache) = cache();
        cache.add(1, "first").unwrap();
        assert!(cache.add(1, "again").is_err());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_try_remove_missing_token() {
        let (_, mut cache) = cache();
        assert_eq!(cache.try_remove(42), None);
        cache.add(42, "task").unwrap();
        assert_eq!(cache.try_remove(42), Some("task"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_returns_entries_at_least_max_age_old() {
        let (manual, mut cache) = cache();
        cache.add(1, "a").unwrap();
        cache.add(2, "b").unwrap();

        manual.advance(Duration::from_secs(5));
        let mut purged = cache.purge(Duration::from_secs(5));
        purged.sort();
        assert_eq!(purged, vec!["a", "b"]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_keeps_younger_entries() {
        let (manual, mut cache) = cache();
        cache.add(1, "old").unwrap();
        manual.advance(Duration::from_secs(3));
        cache.add(2, "young").unwrap();
        manual.advance(Duration::from_millis(2_999));

        assert!(cache.purge(Duration::from_secs(6)).is_empty());
        assert_eq!(cache.purge(Duration::from_secs(5)), vec!["old"]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_purged_entries_are_returned_once() {
        let (manual, mut cache) = cache();
        cache.add(7, "task").unwrap();
        manual.advance(Duration::from_secs(1));
        assert_eq!(cache.purge(Duration::ZERO), vec!["task"]);
        assert!(cache.purge(Duration::ZERO).is_empty());
    }
}
