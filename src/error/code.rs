//! 错误代码和错误类别定义
//!
//! 服务发现链路上的每一种失败都对应一个稳定的错误代码，便于日志聚合和告警规则匹配。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误代码枚举
///
/// 错误代码按类别分组，每个类别占用1000个代码范围：
/// - 1000-1999: 协调存储（Consul）通信错误
/// - 2000-2999: 响应解析错误
/// - 3000-3999: 部署状态错误
/// - 4000-4999: 节点可达性错误
/// - 6000-6999: 系统 / 配置错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 协调存储通信错误 (1000-1999)
    // ============================================================
    StoreUnavailable = 1000,
    StoreTimeout = 1001,
    StoreUnexpectedStatus = 1002,

    // ============================================================
    // 响应解析错误 (2000-2999)
    // ============================================================
    MalformedResponse = 2000,

    // ============================================================
    // 部署状态错误 (3000-3999)
    // ============================================================
    NoMatchingVersion = 3000,
    NoNodes = 3001,
    DiscoveryFailed = 3002,

    // ============================================================
    // 节点可达性错误 (4000-4999)
    // ============================================================
    AllNodesUnreachable = 4000,
    NodeUnreachable = 4001,

    // ============================================================
    // 系统 / 配置错误 (6000-6999)
    // ============================================================
    ConfigurationError = 6000,
    Disposed = 6001,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ErrorCode {
    /// 获取错误代码的数字值
    #[inline]
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// 从数字值创建错误代码
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1000 => Some(ErrorCode::StoreUnavailable),
            1001 => Some(ErrorCode::StoreTimeout),
            1002 => Some(ErrorCode::StoreUnexpectedStatus),
            2000 => Some(ErrorCode::MalformedResponse),
            3000 => Some(ErrorCode::NoMatchingVersion),
            3001 => Some(ErrorCode::NoNodes),
            3002 => Some(ErrorCode::DiscoveryFailed),
            4000 => Some(ErrorCode::AllNodesUnreachable),
            4001 => Some(ErrorCode::NodeUnreachable),
            6000 => Some(ErrorCode::ConfigurationError),
            6001 => Some(ErrorCode::Disposed),
            _ => None,
        }
    }

    /// 获取错误代码的英文标识符
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::StoreUnavailable => "STORE_UNAVAILABLE",
            ErrorCode::StoreTimeout => "STORE_TIMEOUT",
            ErrorCode::StoreUnexpectedStatus => "STORE_UNEXPECTED_STATUS",
            ErrorCode::MalformedResponse => "MALFORMED_RESPONSE",
            ErrorCode::NoMatchingVersion => "NO_MATCHING_VERSION",
            ErrorCode::NoNodes => "NO_NODES",
            ErrorCode::DiscoveryFailed => "DISCOVERY_FAILED",
            ErrorCode::AllNodesUnreachable => "ALL_NODES_UNREACHABLE",
            ErrorCode::NodeUnreachable => "NODE_UNREACHABLE",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::Disposed => "DISPOSED",
        }
    }

    /// 获取错误代码的类别（用于错误分类）
    pub fn category(&self) -> ErrorCategory {
        match self.as_u32() {
            1000..=1999 => ErrorCategory::Store,
            2000..=2999 => ErrorCategory::Decode,
            3000..=3999 => ErrorCategory::Deployment,
            4000..=4999 => ErrorCategory::Reachability,
            _ => ErrorCategory::System,
        }
    }

    /// 判断是否为可重试的错误
    ///
    /// 长轮询循环会对可重试错误按错误重试间隔重新发起请求；
    /// 其余错误需要人工介入（例如版本配置错误）。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::StoreUnavailable
                | ErrorCode::StoreTimeout
                | ErrorCode::StoreUnexpectedStatus
                | ErrorCode::MalformedResponse
                | ErrorCode::NodeUnreachable
        )
    }
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Store,
    Decode,
    Deployment,
    Reachability,
    System,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Store => write!(f, "STORE"),
            ErrorCategory::Decode => write!(f, "DECODE"),
            ErrorCategory::Deployment => write!(f, "DEPLOYMENT"),
            ErrorCategory::Reachability => write!(f, "REACHABILITY"),
            ErrorCategory::System => write!(f, "SYSTEM"),
        }
    }
}
