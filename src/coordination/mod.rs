//! 协调存储（Consul）长轮询客户端抽象
//!
//! 客户端只负责发出一次长轮询请求并解析结果；重试与退避由调用方（监听循环）负责。

pub mod consul;
pub mod model;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::fmt;
use tokio_util::sync::CancellationToken;

use crate::discovery::instance::Node;
use crate::error::{DiscoveryError, RequestContext};

pub use consul::ConsulClient;
pub use model::VersionRecord;

/// 版本游标（Consul 的 modify index）
///
/// 0 表示 "没有先前状态，立即返回"。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionCursor(pub u64);

impl VersionCursor {
    pub const ZERO: VersionCursor = VersionCursor(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// 根据本次响应返回的游标计算下一次请求使用的游标
    ///
    /// - 游标倒退时重置为 0（存储端索引被重置）
    /// - 否则取新游标
    pub fn advance(self, returned: VersionCursor) -> VersionCursor {
        if returned < self {
            VersionCursor::ZERO
        } else {
            returned
        }
    }
}

impl fmt::Display for VersionCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 一次长轮询的结果类别
///
/// 瞬时错误与 "未部署" 标记互斥。
#[derive(Debug, Clone)]
pub enum WatchOutcome<T> {
    /// 成功返回数据
    Data(T),
    /// 目标不存在（404 / "query not found"），不是错误
    Undeployed,
    /// 请求或解析失败
    Failed(DiscoveryError),
}

/// 一次长轮询调用的结果，返回后不可变
#[derive(Debug, Clone)]
pub struct WatchResult<T> {
    pub outcome: WatchOutcome<T>,
    /// 响应携带的新游标；响应头缺失时为 0
    pub cursor: VersionCursor,
    /// 请求上下文（URL、状态码、存储地址）
    pub context: RequestContext,
    /// 原始响应体，仅用于诊断日志
    pub raw_response: String,
}

impl<T> WatchResult<T> {
    pub fn failed(error: DiscoveryError, context: RequestContext) -> Self {
        Self {
            outcome: WatchOutcome::Failed(error),
            cursor: VersionCursor::ZERO,
            context,
            raw_response: String::new(),
        }
    }

    pub fn is_undeployed(&self) -> bool {
        matches!(self.outcome, WatchOutcome::Undeployed)
    }

    pub fn error(&self) -> Option<&DiscoveryError> {
        match &self.outcome {
            WatchOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<&T> {
        match &self.outcome {
            WatchOutcome::Data(data) => Some(data),
            _ => None,
        }
    }

    /// 转换数据部分；转换失败时结果变为 `MalformedResponse`
    pub fn try_map<U, F>(self, f: F) -> WatchResult<U>
    where
        F: FnOnce(T) -> Result<U, String>,
    {
        let outcome = match self.outcome {
            WatchOutcome::Data(data) => match f(data) {
                Ok(mapped) => WatchOutcome::Data(mapped),
                Err(reason) => {
                    tracing::error!(
                        request = %self.context.request_url,
                        error = %reason,
                        raw_response = %self.raw_response,
                        "Failed to decode coordination store response"
                    );
                    WatchOutcome::Failed(DiscoveryError::malformed(self.context.clone(), reason))
                }
            },
            WatchOutcome::Undeployed => WatchOutcome::Undeployed,
            WatchOutcome::Failed(err) => WatchOutcome::Failed(err),
        };
        WatchResult {
            outcome,
            cursor: self.cursor,
            context: self.context,
            raw_response: self.raw_response,
        }
    }
}

impl WatchResult<Option<Vec<u8>>> {
    /// 将键值内容解析为 JSON；空值保持为 `None`
    pub fn decode_json<T: DeserializeOwned>(self) -> WatchResult<Option<T>> {
        self.try_map(|value| match value {
            Some(bytes) => serde_json::from_slice::<T>(&bytes)
                .map(Some)
                .map_err(|e| format!("invalid JSON value: {}", e)),
            None => Ok(None),
        })
    }
}

/// 协调存储客户端
///
/// 每个方法发出一次带 `index` / `wait` 参数的阻塞查询；实现不得内置重试。
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// 监听服务健康节点（只返回通过健康检查的节点）
    async fn watch_health(
        &self,
        service: &str,
        zone: &str,
        cursor: VersionCursor,
        cancel: &CancellationToken,
    ) -> WatchResult<Vec<Node>>;

    /// 监听单个键，返回 base64 解码后的原始值
    async fn watch_key(
        &self,
        folder: &str,
        key: &str,
        zone: &str,
        cursor: VersionCursor,
        cancel: &CancellationToken,
    ) -> WatchResult<Option<Vec<u8>>>;

    /// 列出目录下所有键（相对目录的键名）
    async fn list_keys(
        &self,
        folder: &str,
        zone: &str,
        cursor: VersionCursor,
        cancel: &CancellationToken,
    ) -> WatchResult<Vec<String>>;

    /// 存储地址（用于日志与错误上下文）
    fn address(&self) -> &str;
}
