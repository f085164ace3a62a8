//! Delay between failed connection recreation attempts.
//!
//! The channel manager already waits `reconnect_interval` before every
//! rebuild; this adds an exponential, jittered pause on top of it each time
//! a rebuild or stream reopen fails, so a broker that is down is not hammered.

use std::time::Duration;

use rand::Rng;

/// Backoff settings taken from [`ClientConfig`](crate::config::ClientConfig).
#[derive(Clone, Copy, Debug)]
pub(crate) struct RecreateBackoff {
    /// Pause after the first failed attempt.
    pub(crate) initial_delay: Duration,
    /// Upper bound for any pause.
    pub(crate) max_delay: Duration,
    /// Growth per consecutive failure.
    pub(crate) factor: f64,
    /// Share of the pause that is randomized, `0.0..=1.0`.
    pub(crate) jitter: f64,
}

impl RecreateBackoff {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("Initial reconnect delay must be > 0".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("Max reconnect delay must be >= initial reconnect delay".to_string());
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err("Backoff factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("Jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }

    /// Pause after `failures` consecutive failed attempts (`failures >= 1`).
    pub(crate) fn delay_after(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let capped = (self.initial_delay.as_secs_f64() * self.factor.powi(exponent))
            .min(self.max_delay.as_secs_f64());

        if self.jitter == 0.0 {
            return Duration::from_secs_f64(capped);
        }
        // Keep (1 - jitter) of the pause fixed and draw the rest.
        let fixed = capped * (1.0 - self.jitter);
        let drawn = rand::rng().random_range(0.0..=capped * self.jitter);
        Duration::from_secs_f64(fixed + drawn)
    }
}
