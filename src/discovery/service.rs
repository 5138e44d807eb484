//! 服务发现入口
//!
//! 组装 Consul 客户端、节点来源工厂、发现缓存与健康 / 指标收集，
//! 对外提供节点查询与负载均衡器创建。

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::coordination::{ConsulClient, CoordinationClient};
use crate::discovery::cache::DiscoveryCache;
use crate::discovery::config::{NodeSourceKind, SharedConfig, TrafficRoutingStrategy};
use crate::discovery::factory::{ConsulNodeSourceFactory, NodeSourceFactory, StaticNodeSourceFactory};
use crate::discovery::instance::{DeploymentIdentifier, Node};
use crate::discovery::load_balancer::LoadBalancer;
use crate::discovery::reachability::ReachabilityCheck;
use crate::error::Result;
use crate::health::HealthSink;
use crate::metrics::MetricsCollector;

/// 服务发现
pub struct ServiceDiscovery {
    config: SharedConfig,
    cache: DiscoveryCache,
    consul: Arc<ConsulNodeSourceFactory>,
    health: Arc<dyn HealthSink>,
    metrics: MetricsCollector,
    cancel: CancellationToken,
}

impl ServiceDiscovery {
    /// 使用配置中的 Consul 地址创建
    pub fn new(config: SharedConfig, health: Arc<dyn HealthSink>) -> Result<Self> {
        let metrics = MetricsCollector::new();
        let client = Arc::new(ConsulClient::new(config.clone(), metrics.clone())?);
        Ok(Self::with_client(config, client, health, metrics))
    }

    /// 使用指定的协调存储客户端创建
    pub fn with_client(
        config: SharedConfig,
        client: Arc<dyn CoordinationClient>,
        health: Arc<dyn HealthSink>,
        metrics: MetricsCollector,
    ) -> Self {
        let cancel = CancellationToken::new();
        let consul = Arc::new(ConsulNodeSourceFactory::new(
            client.clone(),
            config.clone(),
            health.clone(),
            metrics.clone(),
            &cancel,
        ));
        let factories: Vec<Arc<dyn NodeSourceFactory>> = vec![
            consul.clone() as Arc<dyn NodeSourceFactory>,
            Arc::new(StaticNodeSourceFactory::new(config.clone(), metrics.clone())),
        ];
        let cache = DiscoveryCache::new(factories, config.clone(), metrics.clone(), &cancel);

        info!(
            consul = %client.address(),
            default_source = %config.load().default_source,
            "Service discovery started"
        );

        Self {
            config,
            cache,
            consul,
            health,
            metrics,
            cancel,
        }
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn cache(&self) -> &DiscoveryCache {
        &self.cache
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// 获取部署的节点列表，`Ok(None)` 表示部署不存在
    pub async fn get_nodes(&self, deployment: &DeploymentIdentifier) -> Result<Option<Arc<Vec<Node>>>> {
        self.cache.get_nodes(deployment).await
    }

    /// 部署是否存在
    ///
    /// 静态来源只要配置了节点即视为存在；Consul 来源查询服务列表。
    pub async fn is_service_deployed(&self, deployment: &DeploymentIdentifier) -> Result<bool> {
        let config = self.config.load();
        match config.source_kind_for(&deployment.service_name) {
            NodeSourceKind::Static => Ok(!config.static_nodes_for(&deployment.service_name).is_empty()),
            NodeSourceKind::Consul => self.consul.is_service_deployed(deployment).await,
        }
    }

    /// 为部署创建负载均衡器
    pub fn create_load_balancer(
        &self,
        deployment: DeploymentIdentifier,
        check: Arc<dyn ReachabilityCheck>,
        strategy: TrafficRoutingStrategy,
    ) -> LoadBalancer {
        LoadBalancer::new(
            deployment,
            self.cache.clone(),
            check,
            strategy,
            self.health.clone(),
            self.metrics.clone(),
            &self.cancel,
        )
    }

    /// 停止所有后台工作
    pub fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cache.shutdown();
        self.cancel.cancel();
        info!("Service discovery shut down");
    }
}

impl Drop for ServiceDiscovery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
