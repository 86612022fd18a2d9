use std::time::Duration;

use lore_settings::CrawlerSettings;

use crate::backoff::Backoff;

#[derive(Clone, Debug)]
pub struct CrawlerConfig {
    pub max_concurrent_rooms: usize,
    pub backoff: Backoff,
    /// Consecutive failures before a pair is stalled.
    pub max_failures: u32,
    /// Minimum gap between two steps of the same pair.
    pub step_interval: Duration,
    /// Timeout for each loader and index call.
    pub request_timeout: Duration,
    /// Capacity of the `CrawlEvent` broadcast channel.
    pub event_capacity: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self::from(&CrawlerSettings::default())
    }
}

impl From<&CrawlerSettings> for CrawlerConfig {
    fn from(s: &CrawlerSettings) -> Self {
        Self {
            max_concurrent_rooms: s.max_concurrent_rooms.max(1),
            backoff: Backoff::new(
                Duration::from_millis(s.backoff_base_ms),
                Duration::from_millis(s.backoff_cap_ms),
                s.backoff_jitter,
            ),
            max_failures: s.max_failures.max(1),
            step_interval: Duration::from_millis(s.step_interval_ms),
            request_timeout: Duration::from_millis(s.request_timeout_ms),
            event_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_settings() {
        let config = CrawlerConfig::default();
        assert_eq!(config.max_failures, 3);
        assert_eq!(config.step_interval, Duration::from_secs(3));
        assert_eq!(config.backoff.base, Duration::from_secs(1));
        assert_eq!(config.backoff.jitter, 0.2);
    }

    #[test]
    fn zero_values_are_floored() {
        let settings = CrawlerSettings {
            max_concurrent_rooms: 0,
            max_failures: 0,
            ..CrawlerSettings::default()
        };
        let config = CrawlerConfig::from(&settings);
        assert_eq!(config.max_concurrent_rooms, 1);
        assert_eq!(config.max_failures, 1);
    }
}
