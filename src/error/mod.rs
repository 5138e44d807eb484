//! Flare Discovery 错误处理模块
//!
//! 提供统一的错误类型和错误代码分类。"未部署" 不是错误，由
//! [`WatchOutcome::Undeployed`](crate::coordination::WatchOutcome) 表达。

pub mod code;
pub mod discovery_error;

pub use code::{ErrorCategory, ErrorCode};
pub use discovery_error::{DiscoveryError, RequestContext, Result, UnreachableNode};
