//! 重试退避策略

use std::time::Duration;

/// 指数退避：第 n 次重试等待 `base * 2^(n-1)`，不超过 `cap`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(30_000),
        }
    }
}

/// 一次失败之后的处理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// attempt 从 1 开始
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// `retry_count` 为本次失败计入后的次数
    pub fn decide(&self, retry_count: u32, max_retries: u32) -> RetryDecision {
        if retry_count <= max_retries {
            RetryDecision::Retry {
                attempt: retry_count,
                delay: self.delay_for(retry_count),
            }
        } else {
            RetryDecision::GiveUp {
                attempts: retry_count,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delays_double_until_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(16_000));
        assert_eq!(policy.delay_for(6), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(30_000));
    }

    #[test]
    fn test_decide_gives_up_after_max_retries() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(1, 2),
            RetryDecision::Retry { attempt: 1, delay: Duration::from_millis(1000) }
        );
        assert_eq!(
            policy.decide(2, 2),
            RetryDecision::Retry { attempt: 2, delay: Duration::from_millis(2000) }
        );
        assert_eq!(policy.decide(3, 2), RetryDecision::GiveUp { attempts: 3 });
    }

    #[test]
    fn test_zero_max_retries_fails_immediately() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(1, 0), RetryDecision::GiveUp { attempts: 1 });
    }
}
