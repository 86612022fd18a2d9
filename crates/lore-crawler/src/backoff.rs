use std::time::Duration;

/// Exponential backoff with symmetric jitter: `base * 2^attempt`, capped,
/// then moved by up to `±jitter` of itself.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, rand::random::<f64>())
    }

    /// `unit` in `[0, 1)` picks the point inside the jitter window.
    pub fn delay_with(&self, attempt: u32, unit: f64) -> Duration {
        let exp = self.base.as_millis() as f64 * 2f64.powi(attempt.min(31) as i32);
        let capped = exp.min(self.cap.as_millis() as f64);
        let spread = capped * self.jitter;
        let jittered = capped - spread + 2.0 * spread * unit.clamp(0.0, 1.0);
        Duration::from_millis(jittered.max(0.0).round() as u64)
    }
}
