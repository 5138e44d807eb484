//! 重试策略模块
//!
//! 退避时长是 `attempt -> Duration` 的纯函数，不持有可变计时状态。

pub mod exponential;
pub mod fixed;

pub use exponential::ExponentialBackoffPolicy;
pub use fixed::FixedRetryPolicy;

use std::time::Duration;

/// 重试策略 trait
pub trait RetryPolicy: Send + Sync {
    /// 第 `attempt` 次（从 0 开始）重试前的等待时长
    fn backoff_duration(&self, attempt: usize) -> Duration;
}
