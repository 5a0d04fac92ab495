/// Exponential backoff with jitter for retrying cloud operations
use rand::Rng;
use std::time::Duration;

/// Retry pacing: exponential backoff with a hard cap and random jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub cap: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: 3,
        }
    }
}

impl Backoff {
    /// Base delay for an attempt number, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.min(16)).unwrap_or(16);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.cap.as_secs_f64()))
    }

    /// Delay for an attempt with up to 50% random jitter added.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = rand::thread_rng().gen_range(0.0..0.5);
        let jittered = base.as_secs_f64() * (1.0 + jitter);
        Duration::from_secs_f64(jittered.min(self.cap.as_secs_f64() * 1.5))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_grows_and_caps() {
        let b = Backoff::default();
        assert_eq!(b.base_delay(0), Duration::from_secs(1));
        assert_eq!(b.base_delay(1), Duration::from_secs(2));
        assert_eq!(b.base_delay(2), Duration::from_secs(4));
        assert_eq!(b.base_delay(10), Duration::from_secs(10));
        assert_eq!(b.base_delay(100), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let b = Backoff::default();
        for attempt in 0..8 {
            let d = b.delay_for_attempt(attempt);
            assert!(d >= b.base_delay(attempt));
            assert!(d <= Duration::from_secs_f64(15.0));
        }
    }

    #[test]
    fn test_should_retry() {
        let b = Backoff::default();
        assert!(b.should_retry(0));
        assert!(b.should_retry(2));
        assert!(!b.should_retry(3));
    }
}
