// THEORY:
// The cooldown table is the deduplication gate between "the tracker saw a
// disappearance" and "we file an incident". The same person tends to trigger
// several disappearances in quick succession (detector flicker, a second item),
// and each of those would otherwise become its own report.
//
// A rejected event is not a failure. It is dropped on the spot: not queued, not
// retried.

use super::tracker::SubjectKey;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct CooldownEntry {
    pub suppressed_until: Instant,
}

/// Per-camera map from subject key to the end of its suppression window.
pub struct CooldownTable {
    cooldown: Duration,
    entries: HashMap<SubjectKey, CooldownEntry>,
}

impl CooldownTable {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            entries: HashMap::new(),
        }
    }

    /// Returns true and opens a new suppression window when `key` is not
    /// currently suppressed; returns false otherwise.
    pub fn admit(&mut self, key: &SubjectKey, now: Instant) -> bool {
        if let Some(entry) = self.entries.get(key) {
            if entry.suppressed_until > now {
                return false;
            }
        }
        self.entries.insert(
            key.clone(),
            CooldownEntry {
                suppressed_until: now + self.cooldown,
            },
        );
        true
    }

    pub fn is_suppressed(&self, key: &SubjectKey, now: Instant) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.suppressed_until > now)
    }

    /// Drops entries whose window has closed.
    pub fn sweep(&mut self, now: Instant) {
        self.entries.retain(|_, e| e.suppressed_until > now);
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
    use crate::detection::Point;

    fn key() -> SubjectKey {
        SubjectKey::quantize("cam1", Point::new(100.0, 100.0), 1.0)
    }

    #[test]
    fn suppresses_within_window() {
        let mut table = CooldownTable::new(Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(table.admit(&key(), t0));
        assert!(!table.admit(&key(), t0 + Duration::from_secs(3)));
        assert!(!table.admit(&key(), t0 + Duration::from_millis(9_999)));
        assert!(table.admit(&key(), t0 + Duration::from_secs(10)));
    }

    #[test]
    fn rejection_does_not_extend_window() {
        let mut table = CooldownTable::new(Duration::from_secs(10));
        let t0 = Instant::now();
        table.admit(&key(), t0);
        table.admit(&key(), t0 + Duration::from_secs(9));
        assert!(table.admit(&key(), t0 + Duration::from_secs(11)));
    }

    #[test]
    fn keys_are_independent() {
        let mut table = CooldownTable::new(Duration::from_secs(10));
        let t0 = Instant::now();
        let other = SubjectKey::quantize("cam1", Point::new(300.0, 100.0), 1.0);
        assert!(table.admit(&key(), t0));
        assert!(table.admit(&other, t0));
        assert!(table.is_suppressed(&other, t0 + Duration::from_secs(1)));
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let mut table = CooldownTable::new(Duration::from_secs(10));
        let t0 = Instant::now();
        table.admit(&key(), t0);
        table.sweep(t0 + Duration::from_secs(5));
        assert_eq!(table.len(), 1);
        table.sweep(t0 + Duration::from_secs(10));
        assert!(table.is_empty());
    }
}
