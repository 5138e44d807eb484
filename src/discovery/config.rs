//! 服务发现配置
//!
//! 配置对象可热更新：组件只持有 [`SharedConfig`]，每次循环 / 每次调用都读取最新快照。

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{DiscoveryError, Result};

/// 可热更新的共享配置
pub type SharedConfig = Arc<ArcSwap<DiscoveryConfig>>;

/// 服务发现配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Consul HTTP 地址
    pub consul_address: String,

    /// 单次长轮询请求超时（毫秒）
    pub request_timeout_ms: u64,

    /// 长轮询等待时间相对请求超时的安全余量（毫秒）
    pub long_poll_margin_ms: u64,

    /// HTTP 传输层超时（毫秒），必须大于长轮询等待时间
    pub transport_timeout_ms: u64,

    /// 长轮询出错后的重试间隔（毫秒），从错误发生时刻起算
    pub error_retry_interval_ms: u64,

    /// 缓存条目空闲多久后被淘汰（毫秒）
    pub cache_idle_lifetime_ms: u64,

    /// 缓存淘汰扫描周期（毫秒）
    pub cache_sweep_interval_ms: u64,

    /// 默认节点来源
    pub default_source: NodeSourceKind,

    /// 按服务名覆盖的配置
    pub services: HashMap<String, ServiceDiscoveryConfig>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            consul_address: "http://localhost:8500".to_string(),
            request_timeout_ms: 30_000,
            long_poll_margin_ms: 2_000,
            transport_timeout_ms: 35_000,
            error_retry_interval_ms: 1_000,
            cache_idle_lifetime_ms: 30 * 60 * 1_000,
            cache_sweep_interval_ms: 30_000,
            default_source: NodeSourceKind::Consul,
            services: HashMap::new(),
        }
    }
}

impl DiscoveryConfig {
    /// 包装为可热更新的共享配置
    pub fn into_shared(self) -> SharedConfig {
        Arc::new(ArcSwap::from_pointee(self))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// 长轮询等待时间：请求超时减去安全余量，最小为 0
    pub fn long_poll_wait(&self) -> Duration {
        self.request_timeout()
            .saturating_sub(Duration::from_millis(self.long_poll_margin_ms))
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }

    pub fn error_retry_interval(&self) -> Duration {
        Duration::from_millis(self.error_retry_interval_ms)
    }

    pub fn cache_idle_lifetime(&self) -> Duration {
        Duration::from_millis(self.cache_idle_lifetime_ms)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_interval_ms)
    }

    /// 服务当前配置的节点来源
    pub fn source_kind_for(&self, service_name: &str) -> NodeSourceKind {
        self.services
            .get(service_name)
            .and_then(|svc| svc.source)
            .unwrap_or(self.default_source)
    }

    /// 服务的静态节点列表（`host[:port]`）
    pub fn static_nodes_for(&self, service_name: &str) -> &[String] {
        self.services
            .get(service_name)
            .map(|svc| svc.static_nodes.as_slice())
            .unwrap_or(&[])
    }

    /// 校验配置
    ///
    /// 传输层超时必须严格大于长轮询等待时间，否则无法区分 "传输挂起" 与 "空的长轮询"。
    pub fn validate(&self) -> Result<()> {
        if self.consul_address.trim().is_empty() {
            return Err(DiscoveryError::config("consul_address must not be empty"));
        }
        if self.transport_timeout() <= self.long_poll_wait() {
            return Err(DiscoveryError::config(format!(
                "transport_timeout_ms ({}) must exceed the long-poll wait ({}ms)",
                self.transport_timeout_ms,
                self.long_poll_wait().as_millis()
            )));
        }
        if self.cache_sweep_interval_ms == 0 {
            return Err(DiscoveryError::config("cache_sweep_interval_ms must be positive"));
        }
        for (name, svc) in &self.services {
            if svc.source == Some(NodeSourceKind::Static) && svc.static_nodes.is_empty() {
                return Err(DiscoveryError::config(format!(
                    "service '{}' uses the static source but lists no static_nodes",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// 单个服务的发现配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDiscoveryConfig {
    /// 节点来源（为空时使用 `default_source`）
    pub source: Option<NodeSourceKind>,

    /// 静态节点列表，`source = "static"` 时生效
    pub static_nodes: Vec<String>,
}

/// 节点来源类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeSourceKind {
    Consul,
    Static,
}

impl NodeSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeSourceKind::Consul => "consul",
            NodeSourceKind::Static => "static",
        }
    }
}

impl std::fmt::Display for NodeSourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeSourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "consul" => Ok(NodeSourceKind::Consul),
            "static" | "config" => Ok(NodeSourceKind::Static),
            _ => Err(format!("Unknown node source: {}", s)),
        }
    }
}

/// 流量路由策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrafficRoutingStrategy {
    /// 轮询
    #[default]
    RoundRobin,
    /// 按请求 ID 固定节点：同一逻辑请求内的重试落在同一节点上，
    /// 没有请求 ID 时退化为轮询
    StableByRequestId,
}

impl std::str::FromStr for TrafficRoutingStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace("-", "_").as_str() {
            "round_robin" | "roundrobin" => Ok(TrafficRoutingStrategy::RoundRobin),
            "stable_by_request_id" | "by_request_id" | "random_by_request_id" => {
                Ok(TrafficRoutingStrategy::StableByRequestId)
            }
            _ => Err(format!("Unknown traffic routing strategy: {}", s)),
        }
    }
}
