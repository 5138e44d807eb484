use super::RetryPolicy;
use std::time::Duration;
use tokio::time::Instant;

/// 固定延迟重试策略
///
/// 长轮询循环出错后使用：下一次请求的时间从错误发生时刻起算，
/// 而不是从当前时刻起算，连续错误不会累积额外延迟。
#[derive(Debug, Clone, Copy)]
pub struct FixedRetryPolicy {
    delay: Duration,
}

impl FixedRetryPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// 错误发生于 `error_at` 时的下一次重试时刻
    pub fn retry_at(&self, error_at: Instant) -> Instant {
        error_at + self.backoff_duration(0)
    }
}

impl RetryPolicy for FixedRetryPolicy {
    fn backoff_duration(&self, _attempt: usize) -> Duration {
        self.delay
    }
}
