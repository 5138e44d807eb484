//! 节点来源
//!
//! 一个节点来源负责一个部署的节点列表。Consul 来源由长轮询驱动，
//! 静态来源直接读取配置中的节点列表。

use std::sync::Arc;
use tracing::debug;

use crate::discovery::config::NodeSourceKind;
use crate::discovery::instance::{DeploymentIdentifier, Node};
use crate::discovery::node_monitor::NodeMonitor;
use crate::discovery::service_list::ServiceListMonitor;
use crate::error::{DiscoveryError, Result};
use crate::metrics::MetricsCollector;

/// 节点来源
pub trait NodeSource: Send + Sync {
    /// 来源类型
    fn kind(&self) -> NodeSourceKind;

    fn deployment(&self) -> &DeploymentIdentifier;

    /// 部署当前是否存在
    fn is_deployed(&self) -> bool;

    /// 当前节点列表
    ///
    /// 列表为空时返回导致为空的原因（版本不匹配 / 存储错误 / 没有节点）。
    fn nodes(&self) -> Result<Arc<Vec<Node>>>;

    /// 停止后台工作，可重复调用
    fn dispose(&self);
}

/// 基于 Consul 长轮询的节点来源
pub struct ConsulNodeSource {
    monitor: NodeMonitor,
    service_list: Arc<ServiceListMonitor>,
    consul_name: String,
    metrics: MetricsCollector,
}

impl ConsulNodeSource {
    pub fn new(
        monitor: NodeMonitor,
        service_list: Arc<ServiceListMonitor>,
        consul_name: impl Into<String>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            monitor,
            service_list,
            consul_name: consul_name.into(),
            metrics,
        }
    }

    pub fn monitor(&self) -> &NodeMonitor {
        &self.monitor
    }
}

impl NodeSource for ConsulNodeSource {
    fn kind(&self) -> NodeSourceKind {
        NodeSourceKind::Consul
    }

    fn deployment(&self) -> &DeploymentIdentifier {
        self.monitor.deployment()
    }

    fn is_deployed(&self) -> bool {
        if self.monitor.is_undeployed() {
            return false;
        }
        // 服务列表出错时保留上一次的结果
        self.service_list.is_service_deployed(&self.consul_name)
    }

    fn nodes(&self) -> Result<Arc<Vec<Node>>> {
        if self.monitor.is_disposed() {
            return Err(DiscoveryError::Disposed(format!(
                "node source for {}",
                self.monitor.deployment()
            )));
        }
        self.monitor.nodes()
    }

    fn dispose(&self) {
        if self.monitor.is_disposed() {
            return;
        }
        self.monitor.dispose();
        self.metrics.record_source_disposed();
    }
}

/// 配置中的静态节点列表
pub struct StaticNodeSource {
    deployment: DeploymentIdentifier,
    nodes: Arc<Vec<Node>>,
}

impl StaticNodeSource {
    /// 解析 `host[:port]` 列表，无法解析的条目被跳过
    pub fn new(deployment: DeploymentIdentifier, endpoints: &[String]) -> Self {
        let nodes: Vec<Node> = endpoints
            .iter()
            .filter_map(|endpoint| {
                let node = Node::parse(endpoint);
                if node.is_none() {
                    debug!(deployment = %deployment, endpoint = %endpoint, "Skipping invalid static node");
                }
                node
            })
            .collect();

        Self {
            deployment,
            nodes: Arc::new(nodes),
        }
    }
}

impl NodeSource for StaticNodeSource {
    fn kind(&self) -> NodeSourceKind {
        NodeSourceKind::Static
    }

    fn deployment(&self) -> &DeploymentIdentifier {
        &self.deployment
    }

    fn is_deployed(&self) -> bool {
        true
    }

    fn nodes(&self) -> Result<Arc<Vec<Node>>> {
        if self.nodes.is_empty() {
            return Err(DiscoveryError::NoNodes {
                deployment: self.deployment.to_string(),
            });
        }
        Ok(self.nodes.clone())
    }

    fn dispose(&self) {}
}
