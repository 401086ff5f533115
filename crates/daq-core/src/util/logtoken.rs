//! Auto-muting guard for hot-path log emissions.

use std::time::{Duration, Instant};

/// Rate limiter for identical log messages.
///
/// Allows at most `max_per_interval` emissions per `interval`; further
/// attempts are counted but suppressed. When a new interval opens after
/// suppression, [`LogToken::suppressed`] reports how many messages were
/// dropped so the caller can mention it once.
///
/// ```
/// use daq_core::util::LogToken;
/// use std::time::Duration;
/// let mut token = LogToken::new(10, Duration::from_secs(60));
/// if token.ok() {
///     tracing::warn!("invalid packet header");
/// }
/// ```
#[derive(Debug)]
pub struct LogToken {
    max_per_interval: u32,
    interval: Duration,
    interval_start: Instant,
    emitted: u32,
    suppressed: u64,
}

impl LogToken {
    pub fn new(max_per_interval: u32, interval: Duration) -> Self {
        Self {
            max_per_interval,
            interval,
            interval_start: Instant::now(),
            emitted: 0,
            suppressed: 0,
        }
    }

    /// Returns true if the caller may emit the message now.
    pub fn ok(&mut self) -> bool {
        if self.interval_start.elapsed() >= self.interval {
            self.interval_start = Instant::now();
            self.emitted = 0;
        }
        if self.emitted < self.max_per_interval {
            self.emitted += 1;
            true
        } else {
            self.suppressed += 1;
            false
        }
    }

    /// Number of messages suppressed so far; resets the counter.
    pub fn suppressed(&mut self) -> u64 {
        std::mem::take(&mut self.suppressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutes_after_limit() {
        let mut t = LogToken::new(3, Duration::from_secs(3600));
        assert!(t.ok());
        assert!(t.ok());
        assert!(t.ok());
        assert!(!t.ok());
        assert!(!t.ok());
        assert_eq!(t.suppressed(), 2);
        assert_eq!(t.suppressed(), 0);
    }

    #[test]
    fn interval_reopens() {
        let mut t = LogToken::new(1, Duration::from_millis(0));
        assert!(t.ok());
        assert!(t.ok());
    }
}
