//! 服务发现统一错误类型
//!
//! 所有变体都可以 `Clone`，以便单次构造（single-flight）的结果被多个等待方共享。

use super::code::ErrorCode;
use std::fmt;
use thiserror::Error;

/// 一次协调存储请求的上下文
///
/// 暴露给调用方的错误只携带摘要；完整的原始响应体只写入日志。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// 部署标识（或监听目标，例如 `service-list`）
    pub deployment: String,
    /// 最后一次请求的 URL
    pub request_url: String,
    /// HTTP 状态码（网络失败时为空）
    pub status: Option<u16>,
    /// 响应体摘要（截断后的前若干字符）
    pub response_summary: Option<String>,
    /// 协调存储地址
    pub store_address: String,
}

impl RequestContext {
    /// 响应摘要的最大长度
    pub const SUMMARY_LIMIT: usize = 256;

    pub fn new(
        deployment: impl Into<String>,
        request_url: impl Into<String>,
        store_address: impl Into<String>,
    ) -> Self {
        Self {
            deployment: deployment.into(),
            request_url: request_url.into(),
            store_address: store_address.into(),
            ..Default::default()
        }
    }

    /// 记录响应状态与响应体摘要
    #[must_use]
    pub fn with_response(mut self, status: u16, body: &str) -> Self {
        self.status = Some(status);
        if !body.is_empty() {
            self.response_summary = Some(body.chars().take(Self::SUMMARY_LIMIT).collect());
        }
        self
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "deployment={}, store={}, request={}",
            self.deployment, self.store_address, self.request_url
        )?;
        if let Some(status) = self.status {
            write!(f, ", status={}", status)?;
        }
        if let Some(summary) = &self.response_summary {
            write!(f, ", response={}", summary)?;
        }
        Ok(())
    }
}

/// 不可达节点描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreachableNode {
    /// `host[:port]`
    pub endpoint: String,
    /// 最近一次失败原因
    pub last_error: Option<String>,
}

impl fmt::Display for UnreachableNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.last_error {
            Some(err) => write!(f, "{} ({})", self.endpoint, err),
            None => write!(f, "{}", self.endpoint),
        }
    }
}

fn join_display<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// 服务发现统一错误类型
#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    /// 网络层失败（连接失败、传输超时等），由长轮询循环退避重试
    #[error("coordination store request failed: {reason} ({context})")]
    Transient {
        reason: String,
        context: Box<RequestContext>,
    },

    /// 非 200 / 404 响应
    #[error("coordination store returned unexpected status {status} ({context})")]
    UnexpectedResponse {
        status: u16,
        context: Box<RequestContext>,
    },

    /// 响应无法解析，按瞬时错误重试
    #[error("malformed coordination store response: {reason} ({context})")]
    MalformedResponse {
        reason: String,
        context: Box<RequestContext>,
    },

    /// 已部署，但没有任何节点携带当前激活版本
    #[error(
        "deployment {deployment} has active version '{active_version}' but none of its {total_nodes} node(s) advertise it (available versions: [{available}])",
        available = .available_versions.join(", ")
    )]
    NoMatchingVersion {
        deployment: String,
        active_version: String,
        total_nodes: usize,
        available_versions: Vec<String>,
    },

    /// 已部署，但当前没有健康节点
    #[error("deployment {deployment} is deployed but reports no healthy nodes")]
    NoNodes { deployment: String },

    /// 所有已知节点都未通过可达性检查
    #[error(
        "all {count} node(s) of {deployment} are unreachable: {detail}",
        count = .nodes.len(),
        detail = join_display(.nodes)
    )]
    AllNodesUnreachable {
        deployment: String,
        nodes: Vec<UnreachableNode>,
    },

    /// 尚未发现任何节点，包装底层原因
    #[error("failed to discover nodes for {deployment}: {source}")]
    Discovery {
        deployment: String,
        #[source]
        source: Box<DiscoveryError>,
    },

    /// 配置错误
    #[error("invalid discovery configuration: {0}")]
    Config(String),

    /// 组件已释放
    #[error("{0} has been disposed")]
    Disposed(String),
}

impl DiscoveryError {
    pub fn transient(context: RequestContext, reason: impl Into<String>) -> Self {
        DiscoveryError::Transient {
            reason: reason.into(),
            context: Box::new(context),
        }
    }

    pub fn unexpected_response(context: RequestContext, status: u16) -> Self {
        DiscoveryError::UnexpectedResponse {
            status,
            context: Box::new(context),
        }
    }

    pub fn malformed(context: RequestContext, reason: impl Into<String>) -> Self {
        DiscoveryError::MalformedResponse {
            reason: reason.into(),
            context: Box::new(context),
        }
    }

    pub fn discovery(deployment: impl Into<String>, source: DiscoveryError) -> Self {
        DiscoveryError::Discovery {
            deployment: deployment.into(),
            source: Box::new(source),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        DiscoveryError::Config(msg.into())
    }

    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            DiscoveryError::Transient { reason, .. } if reason.contains("timed out") => {
                ErrorCode::StoreTimeout
            }
            DiscoveryError::Transient { .. } => ErrorCode::StoreUnavailable,
            DiscoveryError::UnexpectedResponse { .. } => ErrorCode::StoreUnexpectedStatus,
            DiscoveryError::MalformedResponse { .. } => ErrorCode::MalformedResponse,
            DiscoveryError::NoMatchingVersion { .. } => ErrorCode::NoMatchingVersion,
            DiscoveryError::NoNodes { .. } => ErrorCode::NoNodes,
            DiscoveryError::AllNodesUnreachable { .. } => ErrorCode::AllNodesUnreachable,
            DiscoveryError::Discovery { .. } => ErrorCode::DiscoveryFailed,
            DiscoveryError::Config(_) => ErrorCode::ConfigurationError,
            DiscoveryError::Disposed(_) => ErrorCode::Disposed,
        }
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// 请求上下文（仅协调存储相关错误携带）
    pub fn context(&self) -> Option<&RequestContext> {
        match self {
            DiscoveryError::Transient { context, .. }
            | DiscoveryError::UnexpectedResponse { context, .. }
            | DiscoveryError::MalformedResponse { context, .. } => Some(context),
            DiscoveryError::Discovery { source, .. } => source.context(),
            _ => None,
        }
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, DiscoveryError>;
