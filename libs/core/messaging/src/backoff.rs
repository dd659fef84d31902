//! Backoff strategies for reconnect and retry waits.

use std::time::Duration;

/// Strategy for spacing out repeated attempts.
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    /// Fixed delay between attempts
    Fixed(Duration),

    /// Exponential backoff (base * 2^attempt, capped at max)
    Exponential { base: Duration, max: Duration },

    /// Linear backoff (base * (attempt + 1), capped at max)
    Linear { base: Duration, max: Duration },
}

impl BackoffStrategy {
    /// Calculate the delay for a given attempt (starting at 0).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(d) => *d,
            BackoffStrategy::Exponential { base, max } => {
                let delay = base.saturating_mul(2u32.saturating_pow(attempt));
                delay.min(*max)
            }
            BackoffStrategy::Linear { base, max } => {
                let delay = base.saturating_mul(attempt.saturating_add(1));
                delay.min(*max)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed() {
        let backoff = BackoffStrategy::Fixed(Duration::from_secs(3));

        assert_eq!(backoff.delay(0), Duration::from_secs(3));
        assert_eq!(backoff.delay(10), Duration::from_secs(3));
    }

    #[test]
    fn test_exponential() {
        let backoff = BackoffStrategy::Exponential {
            base: Duration::from_secs(2),
            max: Duration::from_secs(30),
        };

        assert_eq!(backoff.delay(0), Duration::from_secs(2));
        assert_eq!(backoff.delay(1), Duration::from_secs(4));
        assert_eq!(backoff.delay(2), Duration::from_secs(8));
        assert_eq!(backoff.delay(6), Duration::from_secs(30)); // Capped
    }

    #[test]
    fn test_linear() {
        let backoff = BackoffStrategy::Linear {
            base: Duration::from_secs(5),
            max: Duration::from_secs(60),
        };

        assert_eq!(backoff.delay(0), Duration::from_secs(5)); // 5 * 1
        assert_eq!(backoff.delay(1), Duration::from_secs(10)); // 5 * 2
        assert_eq!(backoff.delay(20), Duration::from_secs(60)); // Capped
    }
}
