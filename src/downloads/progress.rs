// Progress throttling for ledger writes and downloadProgress events
//
// Report on every whole percent or status change, otherwise at most once per interval.

use dashmap::DashMap;
use std::time::{Duration, Instant};

struct Mark {
    percent: u8,
    at: Instant,
}

pub struct ProgressThrottle {
    interval: Duration,
    marks: DashMap<String, Mark>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            marks: DashMap::new(),
        }
    }

    /// Whether this update should be persisted and published. Records it if so.
    pub fn should_flush(&self, download_id: &str, percent: u8, status_changed: bool) -> bool {
        let now = Instant::now();
        let flush = status_changed
            || match self.marks.get(download_id) {
                None => true,
                Some(mark) => mark.percent != percent || now.duration_since(mark.at) >= self.interval,
            };

        if flush {
            self.marks.insert(download_id.to_string(), Mark { percent, at: now });
        }
        flush
    }

    pub fn forget(&self, download_id: &str) {
        self.marks.remove(download_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_update_flushes() {
        let throttle = ProgressThrottle::new(Duration::from_secs(60));
        assert!(throttle.should_flush("a", 0, false));
        assert!(throttle.should_flush("b", 0, false));
    }

    #[test]
    fn test_same_percent_is_suppressed_until_interval() {
        let throttle = ProgressThrottle::new(Duration::from_secs(60));
        assert!(throttle.should_flush("a", 10, false));
        assert!(!throttle.should_flush("a", 10, false));
        assert!(throttle.should_flush("a", 11, false));
        assert!(throttle.should_flush("a", 11, true));
    }

    #[test]
    fn test_interval_elapsed_flushes() {
        let throttle = ProgressThrottle::new(Duration::ZERO);
        assert!(throttle.should_flush("a", 5, false));
        assert!(throttle.should_flush("a", 5, false));
    }

    #[test]
    fn test_forget_resets() {
        let throttle = ProgressThrottle::new(Duration::from_secs(60));
        assert!(throttle.should_flush("a", 3, false));
        throttle.forget("a");
        assert!(throttle.should_flush("a", 3, false));
    }
}
