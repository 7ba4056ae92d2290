use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota};
use tracing::{debug, info};

use crate::models::{rate_limit::RateLimitConfig, request::Channel};

/// Outbound call budget for one channel, shared by its workers.
pub struct RateLimiter {
    channel: Channel,
    limiter: DefaultDirectRateLimiter,
}

impl RateLimiter {
    pub fn new(channel: Channel, config: &RateLimitConfig) -> Self {
        let per_second = NonZeroU32::new(config.per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst).unwrap_or(per_second);

        info!(
            channel = %channel,
            per_second = per_second.get(),
            burst = burst.get(),
            "Rate limiter initialized"
        );

        Self {
            channel,
            limiter: governor::RateLimiter::direct(Quota::per_second(per_second).allow_burst(burst)),
        }
    }

    /// Waits until a call is permitted.
    pub async fn acquire(&self) {
        if self.limiter.check().is_err() {
            debug!(channel = %self.channel, "Rate limit reached, waiting for capacity");
            self.limiter.until_ready().await;
        }
    }

    /// Takes a permit without waiting.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_limited() {
        let limiter = RateLimiter::new(
            Channel::Sms,
            &RateLimitConfig {
                per_second: 1,
                burst: 3,
            },
        );

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_replenishment() {
        let limiter = RateLimiter::new(
            Channel::Email,
            &RateLimitConfig {
                per_second: 20,
                burst: 1,
            },
        );

        let start = std::time::Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= std::time::Duration::from_millis(40));
    }
}
