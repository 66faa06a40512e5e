//! Reconnection backoff schedule.

use std::time::Duration;

use crate::config::ReconnectSection;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    pub delay: Duration,
    pub delay_max: Duration,
    pub factor: f64,
}

impl ReconnectPolicy {
    pub fn from_config(cfg: &ReconnectSection) -> Self {
        Self {
            attempts: cfg.attempts,
            delay: Duration::from_millis(cfg.delay_ms),
            delay_max: Duration::from_millis(cfg.delay_max_ms),
            factor: cfg.factor,
        }
    }

    /// Wait before attempt `n` (1-based): `delay * factor^(n-1)`, capped at
    /// `delay_max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let ms = self.delay.as_millis() as f64 * self.factor.powi(exp);
        let cap = self.delay_max.as_millis() as f64;
        if !ms.is_finite() || ms >= cap {
            return self.delay_max;
        }
        Duration::from_millis(ms as u64)
    }
}
