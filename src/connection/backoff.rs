//! Reconnect backoff with jitter.

use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential backoff state for one reconnect loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    max: Duration,
    multiplier: f64,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let initial = Duration::from_millis(config.initial_ms);
        Self {
            max: Duration::from_millis(config.max_ms),
            multiplier: config.multiplier,
            current: initial,
            attempt: 0,
        }
    }

    /// Number of delays handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Next delay, jittered to 75%–125% of the nominal value and never
    /// above the configured maximum.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.current;
        self.attempt += 1;
        self.current = Duration::from_secs_f64(
            (nominal.as_secs_f64() * self.multiplier).min(self.max.as_secs_f64()),
        );
        let jitter_factor = 0.75 + (rand_factor() * 0.5);
        Duration::from_secs_f64(nominal.as_secs_f64() * jitter_factor).min(self.max)
    }
}

/// Pseudo-random factor in [0, 1) without pulling in a rand crate.
fn rand_factor() -> f64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);

    (hasher.finish() % 10_000) as f64 / 10_000.0
}
