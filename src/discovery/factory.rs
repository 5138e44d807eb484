//! 节点来源工厂
//!
//! 每种来源类型一个工厂。缓存通过工厂构造来源，并在替换前询问部署状态。

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::coordination::CoordinationClient;
use crate::discovery::config::{NodeSourceKind, SharedConfig};
use crate::discovery::instance::DeploymentIdentifier;
use crate::discovery::node_monitor::NodeMonitor;
use crate::discovery::service_list::ServiceListMonitor;
use crate::discovery::source::{ConsulNodeSource, NodeSource, StaticNodeSource};
use crate::error::{DiscoveryError, Result};
use crate::health::HealthSink;
use crate::metrics::MetricsCollector;

/// 工厂对部署存在性的判断
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStatus {
    Deployed,
    NotDeployed,
    /// 尚未收敛，此时不允许替换已有来源
    Unknown,
}

/// 节点来源工厂
#[async_trait]
pub trait NodeSourceFactory: Send + Sync {
    fn kind(&self) -> NodeSourceKind;

    /// 同步查询部署状态（只读已收敛的数据，不发起请求）
    fn deployment_status(&self, deployment: &DeploymentIdentifier) -> DeploymentStatus;

    /// 构造并初始化节点来源；部署不存在时返回 `None`
    async fn create(&self, deployment: &DeploymentIdentifier) -> Result<Option<Arc<dyn NodeSource>>>;

    /// 释放工厂持有的后台工作
    fn dispose(&self) {}
}

/// Consul 来源工厂
///
/// 每个可用区共享一个服务列表监听器，只有服务列表中存在的部署才会创建节点监听器。
pub struct ConsulNodeSourceFactory {
    client: Arc<dyn CoordinationClient>,
    config: SharedConfig,
    health: Arc<dyn HealthSink>,
    metrics: MetricsCollector,
    service_lists: DashMap<String, Arc<ServiceListMonitor>>,
    cancel: CancellationToken,
}

impl ConsulNodeSourceFactory {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        config: SharedConfig,
        health: Arc<dyn HealthSink>,
        metrics: MetricsCollector,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            client,
            config,
            health,
            metrics,
            service_lists: DashMap::new(),
            cancel: parent.child_token(),
        }
    }

    /// 获取（必要时启动）可用区的服务列表监听器，并等待其初始化
    pub async fn service_list(&self, zone: &str) -> Arc<ServiceListMonitor> {
        let monitor = self
            .service_lists
            .entry(zone.to_string())
            .or_insert_with(|| {
                info!(zone = %zone, "Starting service list monitor");
                Arc::new(ServiceListMonitor::start(
                    zone,
                    self.client.clone(),
                    self.config.clone(),
                    self.health.clone(),
                    &self.cancel,
                ))
            })
            .clone();
        monitor.init().await;
        monitor
    }

    /// 检查部署是否出现在服务列表中
    pub async fn is_service_deployed(&self, deployment: &DeploymentIdentifier) -> Result<bool> {
        let list = self.service_list(&deployment.zone).await;
        Self::ensure_converged(&list, deployment)?;
        Ok(list.is_service_deployed(&deployment.consul_service_name()))
    }

    fn ensure_converged(list: &ServiceListMonitor, deployment: &DeploymentIdentifier) -> Result<()> {
        if list.is_converged() {
            return Ok(());
        }
        let cause = list
            .last_error()
            .unwrap_or_else(|| DiscoveryError::Disposed("service list monitor".to_string()));
        Err(DiscoveryError::discovery(deployment.to_string(), cause))
    }
}

#[async_trait]
impl NodeSourceFactory for ConsulNodeSourceFactory {
    fn kind(&self) -> NodeSourceKind {
        NodeSourceKind::Consul
    }

    fn deployment_status(&self, deployment: &DeploymentIdentifier) -> DeploymentStatus {
        let Some(list) = self.service_lists.get(&deployment.zone).map(|l| l.clone()) else {
            return DeploymentStatus::Unknown;
        };
        if !list.is_converged() {
            return DeploymentStatus::Unknown;
        }
        if list.is_service_deployed(&deployment.consul_service_name()) {
            DeploymentStatus::Deployed
        } else {
            DeploymentStatus::NotDeployed
        }
    }

    async fn create(&self, deployment: &DeploymentIdentifier) -> Result<Option<Arc<dyn NodeSource>>> {
        if self.cancel.is_cancelled() {
            return Err(DiscoveryError::Disposed("consul node source factory".to_string()));
        }

        let list = self.service_list(&deployment.zone).await;
        Self::ensure_converged(&list, deployment)?;

        let Some(consul_name) = list.resolve_service_name(&deployment.consul_service_name()) else {
            debug!(deployment = %deployment, "Deployment not in service list, no monitor created");
            return Ok(None);
        };

        let monitor = NodeMonitor::start(
            deployment.clone(),
            consul_name.clone(),
            self.client.clone(),
            self.config.clone(),
            self.health.clone(),
            &self.cancel,
        );
        monitor.init().await;
        self.metrics.record_source_created();

        Ok(Some(Arc::new(ConsulNodeSource::new(
            monitor,
            list,
            consul_name,
            self.metrics.clone(),
        ))))
    }

    fn dispose(&self) {
        self.cancel.cancel();
        for entry in self.service_lists.iter() {
            entry.value().dispose();
        }
        self.service_lists.clear();
    }
}

/// 静态来源工厂：节点列表来自配置
pub struct StaticNodeSourceFactory {
    config: SharedConfig,
    metrics: MetricsCollector,
}

impl StaticNodeSourceFactory {
    pub fn new(config: SharedConfig, metrics: MetricsCollector) -> Self {
        Self { config, metrics }
    }
}

#[async_trait]
impl NodeSourceFactory for StaticNodeSourceFactory {
    fn kind(&self) -> NodeSourceKind {
        NodeSourceKind::Static
    }

    fn deployment_status(&self, deployment: &DeploymentIdentifier) -> DeploymentStatus {
        if self.config.load().static_nodes_for(&deployment.service_name).is_empty() {
            DeploymentStatus::NotDeployed
        } else {
            DeploymentStatus::Deployed
        }
    }

    async fn create(&self, deployment: &DeploymentIdentifier) -> Result<Option<Arc<dyn NodeSource>>> {
        let config = self.config.load();
        let endpoints = config.static_nodes_for(&deployment.service_name);
        if endpoints.is_empty() {
            return Ok(None);
        }
        self.metrics.record_source_created();
        Ok(Some(Arc::new(StaticNodeSource::new(deployment.clone(), endpoints))))
    }
}
