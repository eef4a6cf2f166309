//! Alert de-duplication.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Remembers alert keys seen inside a sliding window.
#[derive(Debug)]
pub struct AlertDeduplicator {
    window: Duration,
    seen: HashMap<String, DateTime<Utc>>,
    order: VecDeque<(DateTime<Utc>, String)>,
}

impl AlertDeduplicator {
    /// Create a de-duplicator with the given window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Whether `key` was recorded inside the window ending at `now`.
    pub fn is_duplicate(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        self.prune(now);
        self.seen.contains_key(key)
    }

    /// Remember `key` as accepted at `now`.
    ///
    /// Only accepted alerts are recorded, so an alert that was rejected
    /// can be sent again once its cause is resolved.
    pub fn record(&mut self, key: &str, now: DateTime<Utc>) {
        self.prune(now);
        if self.seen.contains_key(key) {
            return;
        }
        self.seen.insert(key.to_string(), now);
        self.order.push_back((now, key.to_string()));
    }

    /// Keys currently remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether no keys are remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some((at, _)) = self.order.front() {
            let age = (now - *at).to_std().unwrap_or_default();
            if age < self.window {
                break;
            }
            if let Some((at, key)) = self.order.pop_front() {
                if self.seen.get(&key) == Some(&at) {
                    self.seen.remove(&key);
                }
            }
        }
    }
}
