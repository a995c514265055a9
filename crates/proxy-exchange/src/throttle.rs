use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Remembers when a keyed warning was last emitted so repeated conditions do
/// not flood the log. Owned by the runtime context, one per process.
#[derive(Default)]
pub struct LogThrottle {
    last: Mutex<HashMap<String, Instant>>,
    once: Mutex<HashSet<String>>,
}

impl LogThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `key` has not been logged within `interval`.
    pub fn should_log(&self, key: &str, interval: Duration) -> bool {
        self.should_log_at(key, interval, Instant::now())
    }

    pub fn should_log_at(&self, key: &str, interval: Duration, now: Instant) -> bool {
        let mut guard = self.last.lock();
        if let Some(last) = guard.get(key) {
            if now.duration_since(*last) < interval {
                return false;
            }
        }
        guard.insert(key.to_string(), now);
        true
    }

    /// True the first time `key` is seen.
    pub fn first_time(&self, key: &str) -> bool {
        self.once.lock().insert(key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppresses_within_interval() {
        let throttle = LogThrottle::new();
        let start = Instant::now();
        let interval = Duration::from_secs(300);
        assert!(throttle.should_log_at("proxy:a", interval, start));
        assert!(!throttle.should_log_at("proxy:a", interval, start + Duration::from_secs(299)));
        assert!(throttle.should_log_at("proxy:b", interval, start));
        assert!(throttle.should_log_at("proxy:a", interval, start + Duration::from_secs(300)));
    }

    #[test]
    fn first_time_fires_once_per_key() {
        let throttle = LogThrottle::new();
        assert!(throttle.first_time("proxy config"));
        assert!(!throttle.first_time("proxy config"));
        assert!(throttle.first_time("proxy data"));
    }
}
