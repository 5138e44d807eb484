//! 工具函数模块

use std::future::Future;

tokio::task_local! {
    static REQUEST_ID: String;
}

/// 在请求 ID 上下文中执行 future
///
/// 上下文内的负载均衡调用可按请求 ID 固定节点。
///
/// # 示例
/// ```rust,no_run
/// use flare_discovery::utils::{current_request_id, with_request_id};
///
/// # async fn example() {
/// with_request_id("req-42", async {
///     assert_eq!(current_request_id().as_deref(), Some("req-42"));
/// })
/// .await;
/// # }
/// ```
pub async fn with_request_id<F>(request_id: impl Into<String>, fut: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id.into(), fut).await
}

/// 当前上下文中的请求 ID
pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(|id| id.clone()).ok()
}

/// 对当前请求 ID 执行 `f`，不复制字符串
pub fn with_current_request_id<R>(f: impl FnOnce(&str) -> R) -> Option<R> {
    REQUEST_ID.try_with(|id| f(id)).ok()
}

/// 生成新的请求 ID
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
