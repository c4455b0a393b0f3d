//! Bounded exponential backoff with jitter, shared by every channel
//! transport's reconnect loop.

use std::time::Duration;

use rand::Rng;
use sa_domain::config::ReconnectConfig;

/// Wraps a [`ReconnectConfig`] and turns an attempt counter into a delay
/// (or a give-up signal once the configured attempt cap is hit).
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    cfg: ReconnectConfig,
}

impl ReconnectPolicy {
    pub fn new(cfg: ReconnectConfig) -> Self {
        Self { cfg }
    }

    /// Delay before attempt number `attempt` (0-based). `None` means give up.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if let Some(max_attempts) = self.cfg.max_attempts {
            if attempt >= max_attempts {
                return None;
            }
        }

        let base = self.cfg.min_delay_ms as f64 * 2f64.powi(attempt as i32);
        let capped = base.min(self.cfg.max_delay_ms as f64);
        let jitter_factor = self.cfg.jitter_factor.clamp(0.0, 1.0);
        let jitter_span = capped * jitter_factor;
        let jitter = if jitter_span > 0.0 {
            rand::thread_rng().gen_range(-jitter_span..=jitter_span)
        } else {
            0.0
        };
        let delay_ms = (capped + jitter).max(0.0) as u64;
        Some(Duration::from_millis(delay_ms))
    }

    pub fn give_up(&self, attempt: u32) -> bool {
        self.next_delay(attempt).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy::new(ReconnectConfig {
            min_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts,
            jitter_factor: 0.2,
        })
    }

    #[test]
    fn first_attempt_is_near_min_delay() {
        let p = policy(None);
        let d = p.next_delay(0).unwrap();
        assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1_200));
    }

    #[test]
    fn backoff_grows_and_caps_at_max() {
        let p = policy(None);
        let d10 = p.next_delay(10).unwrap();
        assert!(d10 <= Duration::from_millis(72_000));
        assert!(d10 >= Duration::from_millis(48_000));
    }

    #[test]
    fn gives_up_past_max_attempts() {
        let p = policy(Some(3));
        assert!(p.next_delay(0).is_some());
        assert!(p.next_delay(2).is_some());
        assert!(p.next_delay(3).is_none());
        assert!(p.give_up(5));
    }

    #[test]
    fn no_attempt_cap_never_gives_up() {
        let p = policy(None);
        assert!(!p.give_up(1_000));
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let p = ReconnectPolicy::new(ReconnectConfig {
            min_delay_ms: 500,
            max_delay_ms: 4_000,
            max_attempts: None,
            jitter_factor: 0.0,
        });
        assert_eq!(p.next_delay(0), Some(Duration::from_millis(500)));
        assert_eq!(p.next_delay(1), Some(Duration::from_millis(1_000)));
        assert_eq!(p.next_delay(3), Some(Duration::from_millis(4_000)));
    }
}
