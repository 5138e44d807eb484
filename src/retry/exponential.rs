use super::RetryPolicy;
use std::time::Duration;

/// 指数退避重试策略
///
/// 第 `attempt` 次（从 0 开始）的延迟为 `base_delay * 2^attempt`，上限 `max_delay`。
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoffPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoffPolicy {
    /// 不限次数的退避，只能由成功或取消结束
    pub fn unbounded(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// 节点可达性检查使用的退避：1ms 起步，每次翻倍，最多 2s
    pub fn reachability() -> Self {
        Self::unbounded(Duration::from_millis(1), Duration::from_secs(2))
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn backoff_duration(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.min(31);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}
