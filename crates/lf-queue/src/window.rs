use chrono::{DateTime, TimeZone, Timelike};
use lf_common::QueueConfig;
use std::time::Duration;

/// Hours of the day during which a queue releases messages to its workers.
///
/// `[begin, end)` in local time; `begin > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeueWindow {
    begin: u8,
    end: u8,
}

impl DequeueWindow {
    pub fn new(begin: u8, end: u8) -> Self {
        Self { begin, end }
    }

    /// `None` when the configuration leaves the queue open all day.
    pub fn from_config(config: &QueueConfig) -> Option<Self> {
        let begin = config.dequeue_time_begin.unwrap_or(0);
        let end = config.dequeue_time_end.unwrap_or(24);
        if begin == end || (begin == 0 && end >= 24) {
            return None;
        }
        Some(Self::new(begin, end.min(24)))
    }

    pub fn contains(&self, hour: u32) -> bool {
        let (begin, end) = (self.begin as u32, self.end as u32);
        if begin < end {
            hour >= begin && hour < end
        } else {
            hour >= begin || hour < end
        }
    }

    /// Zero while the window is open, otherwise the time until `begin` o'clock.
    pub fn time_until_open<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Duration {
        if self.contains(now.hour()) {
            return Duration::ZERO;
        }
        let hours_ahead = (self.begin as u64 + 24 - now.hour() as u64) % 24;
        let elapsed_in_hour = now.minute() as u64 * 60 + now.second() as u64;
        let secs = (hours_ahead * 3600).saturating_sub(elapsed_in_hour).max(1);
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_daytime_window() {
        let window = DequeueWindow::new(8, 17);
        assert!(!window.contains(7));
        assert!(window.contains(8));
        assert!(window.contains(16));
        assert!(!window.contains(17));
    }

    #[test]
    fn test_window_wraps_midnight() {
        let window = DequeueWindow::new(22, 6);
        assert!(window.contains(23));
        assert!(window.contains(0));
        assert!(window.contains(5));
        assert!(!window.contains(6));
        assert!(!window.contains(12));
    }

    #[test]
    fn test_full_day_is_no_window() {
        assert!(DequeueWindow::from_config(&QueueConfig::default()).is_none());
        let config = QueueConfig {
            dequeue_time_begin: Some(1),
            dequeue_time_end: Some(5),
            ..QueueConfig::default()
        };
        assert_eq!(DequeueWindow::from_config(&config), Some(DequeueWindow::new(1, 5)));
    }

    #[test]
    fn test_time_until_open() {
        let window = DequeueWindow::new(10, 12);
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap();
        assert_eq!(window.time_until_open(&now), Duration::from_secs(90 * 60));

        let open = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
        assert_eq!(window.time_until_open(&open), Duration::ZERO);

        let late = Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap();
        assert_eq!(window.time_until_open(&late), Duration::from_secs(21 * 3600));
    }
}
