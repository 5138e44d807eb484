//! 负载均衡模块
//!
//! 每次选择时从发现缓存读取最新节点列表；列表标识变化时重新对齐每个节点的可达性跟踪器。
//! 只在可达节点中选择，调用方可报告节点不可达，节点恢复后自动回到候选集。

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::discovery::cache::DiscoveryCache;
use crate::discovery::config::TrafficRoutingStrategy;
use crate::discovery::instance::{DeploymentIdentifier, Node};
use crate::discovery::reachability::{NodeReachabilityTracker, ReachabilityCheck};
use crate::error::{DiscoveryError, Result, UnreachableNode};
use crate::health::{HealthRecord, HealthSink};
use crate::metrics::MetricsCollector;
use crate::utils::with_current_request_id;

/// 当前节点视图（不可变，整体替换）
#[derive(Default)]
struct BalancerView {
    /// 生成本视图的节点列表，按指针标识比较
    source_nodes: Option<Arc<Vec<Node>>>,
    trackers: Vec<Arc<NodeReachabilityTracker>>,
    reachable: Vec<Node>,
}

impl BalancerView {
    fn new(source_nodes: Option<Arc<Vec<Node>>>, trackers: Vec<Arc<NodeReachabilityTracker>>) -> Self {
        let reachable = trackers
            .iter()
            .filter(|tracker| tracker.is_reachable())
            .map(|tracker| tracker.node().clone())
            .collect();
        Self {
            source_nodes,
            trackers,
            reachable,
        }
    }

    fn is_built_from(&self, nodes: &Arc<Vec<Node>>) -> bool {
        self.source_nodes
            .as_ref()
            .is_some_and(|source| Arc::ptr_eq(source, nodes))
    }
}

struct BalancerInner {
    deployment: DeploymentIdentifier,
    cache: DiscoveryCache,
    check: Arc<dyn ReachabilityCheck>,
    strategy: TrafficRoutingStrategy,
    view: ArcSwap<BalancerView>,
    /// 视图的所有写入方互斥
    write_lock: Mutex<()>,
    counter: AtomicUsize,
    health: Arc<dyn HealthSink>,
    metrics: MetricsCollector,
    cancel: CancellationToken,
    self_ref: Weak<BalancerInner>,
}

/// 负载均衡器
pub struct LoadBalancer {
    inner: Arc<BalancerInner>,
}

impl LoadBalancer {
    /// 创建新的负载均衡器
    pub fn new(
        deployment: DeploymentIdentifier,
        cache: DiscoveryCache,
        check: Arc<dyn ReachabilityCheck>,
        strategy: TrafficRoutingStrategy,
        health: Arc<dyn HealthSink>,
        metrics: MetricsCollector,
        parent: &CancellationToken,
    ) -> Self {
        let inner = Arc::new_cyclic(|self_ref| BalancerInner {
            deployment,
            cache,
            check,
            strategy,
            view: ArcSwap::from_pointee(BalancerView::default()),
            write_lock: Mutex::new(()),
            counter: AtomicUsize::new(0),
            health,
            metrics,
            cancel: parent.child_token(),
            self_ref: self_ref.clone(),
        });
        Self { inner }
    }

    pub fn deployment(&self) -> &DeploymentIdentifier {
        &self.inner.deployment
    }

    pub fn strategy(&self) -> TrafficRoutingStrategy {
        self.inner.strategy
    }

    /// 选择一个节点
    ///
    /// - `Ok(None)`：部署不存在
    /// - `AllNodesUnreachable`：有节点但全部不可达，错误中列出每个节点及其最近错误
    /// - `Discovery`：从未发现节点，包装底层原因
    pub async fn get_node(&self) -> Result<Option<Node>> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(DiscoveryError::Disposed(format!("load balancer for {}", inner.deployment)));
        }

        let nodes = match inner.cache.get_nodes(&inner.deployment).await {
            Ok(Some(nodes)) => nodes,
            Ok(None) => return Ok(None),
            Err(e @ DiscoveryError::Discovery { .. }) => return Err(e),
            Err(e) => return Err(DiscoveryError::discovery(inner.deployment.to_string(), e)),
        };
        if nodes.is_empty() {
            return Err(DiscoveryError::discovery(
                inner.deployment.to_string(),
                DiscoveryError::NoNodes {
                    deployment: inner.deployment.to_string(),
                },
            ));
        }

        let view = inner.refresh(nodes);
        if view.reachable.is_empty() {
            return Err(DiscoveryError::AllNodesUnreachable {
                deployment: inner.deployment.to_string(),
                nodes: view
                    .trackers
                    .iter()
                    .map(|tracker| UnreachableNode {
                        endpoint: tracker.node().endpoint(),
                        last_error: tracker.last_error(),
                    })
                    .collect(),
            });
        }

        Ok(Some(inner.select(&view.reachable)))
    }

    /// 报告节点不可达
    ///
    /// 节点立即从候选集中移除，并启动（至多一轮）后台可达性检查。
    pub fn report_unreachable(&self, node: &Node, error: Option<String>) {
        let inner = &self.inner;
        let view = inner.view.load_full();
        let Some(tracker) = view.trackers.iter().find(|t| t.node() == node) else {
            debug!(deployment = %inner.deployment, node = %node, "Ignoring report for unknown node");
            return;
        };
        tracker.report_unreachable(error);
        inner.recompute();
    }

    /// 当前可达节点
    pub fn reachable_nodes(&self) -> Vec<Node> {
        self.inner.view.load().reachable.clone()
    }

    /// 当前跟踪的全部节点（含不可达）
    pub fn tracked_nodes(&self) -> Vec<Node> {
        self.inner
            .view
            .load()
            .trackers
            .iter()
            .map(|tracker| tracker.node().clone())
            .collect()
    }

    /// 停止所有可达性检查
    pub fn dispose(&self) {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return;
        }
        inner.cancel.cancel();
        inner.health.remove(&inner.component());
        debug!(deployment = %inner.deployment, "Load balancer disposed");
    }
}

impl Drop for LoadBalancer {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl BalancerInner {
    fn component(&self) -> String {
        format!("balancer:{}", self.deployment)
    }

    /// 节点列表标识变化时对齐跟踪器：保留仍存在的，新建新增的，停止被移除的
    fn refresh(&self, nodes: Arc<Vec<Node>>) -> Arc<BalancerView> {
        let current = self.view.load_full();
        if current.is_built_from(&nodes) {
            return current;
        }

        let view = {
            let _guard = self.write_lock.lock();
            let current = self.view.load_full();
            if current.is_built_from(&nodes) {
                return current;
            }

            let mut added = 0usize;
            let trackers: Vec<Arc<NodeReachabilityTracker>> = nodes
                .iter()
                .map(|node| match current.trackers.iter().find(|t| t.node() == node) {
                    Some(tracker) => tracker.clone(),
                    None => {
                        added += 1;
                        self.new_tracker(node.clone())
                    }
                })
                .collect();

            let mut removed = 0usize;
            for tracker in current.trackers.iter().filter(|t| !nodes.contains(t.node())) {
                tracker.stop();
                removed += 1;
            }

            let view = Arc::new(BalancerView::new(Some(nodes), trackers));
            self.view.store(view.clone());
            if added > 0 || removed > 0 {
                info!(
                    deployment = %self.deployment,
                    nodes = view.trackers.len(),
                    added,
                    removed,
                    "Load balancer nodes reconciled"
                );
            }
            view
        };

        self.publish_health(&view);
        view
    }

    /// 跟踪器状态变化后重新计算可达节点
    fn recompute(&self) {
        let view = {
            let _guard = self.write_lock.lock();
            let current = self.view.load_full();
            let view = Arc::new(BalancerView::new(
                current.source_nodes.clone(),
                current.trackers.clone(),
            ));
            self.view.store(view.clone());
            view
        };
        self.publish_health(&view);
    }

    fn new_tracker(&self, node: Node) -> Arc<NodeReachabilityTracker> {
        let balancer = self.self_ref.clone();
        Arc::new(NodeReachabilityTracker::new(
            node,
            self.check.clone(),
            Arc::new(move |_node: &Node| {
                if let Some(balancer) = balancer.upgrade() {
                    balancer.recompute();
                }
            }),
            self.metrics.clone(),
            &self.cancel,
        ))
    }

    fn select(&self, reachable: &[Node]) -> Node {
        let index = match self.strategy {
            TrafficRoutingStrategy::RoundRobin => self.next_round_robin(),
            TrafficRoutingStrategy::StableByRequestId => with_current_request_id(|id| {
                let mut hasher = DefaultHasher::new();
                id.hash(&mut hasher);
                hasher.finish() as usize
            })
            .unwrap_or_else(|| self.next_round_robin()),
        };
        reachable[index % reachable.len()].clone()
    }

    fn next_round_robin(&self) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    fn publish_health(&self, view: &BalancerView) {
        if self.cancel.is_cancelled() {
            return;
        }
        let total = view.trackers.len();
        let reachable = view.reachable.len();
        let record = if total == 0 || reachable > 0 {
            HealthRecord::healthy(format!("{}/{} node(s) reachable", reachable, total))
        } else {
            HealthRecord::unhealthy(format!("all {} node(s) unreachable", total))
        };
        self.health.publish(&self.component(), record);
    }
}
