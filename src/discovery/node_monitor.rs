//! 单个部署的节点监听器
//!
//! 两个长轮询循环并发运行：
//! - 健康循环：监听通过健康检查的节点列表
//! - 版本循环：监听 `service/{name}` 中的激活版本
//!
//! 两者只通过共享的 [`DeploymentState`] 交互。每次更新都在同一把锁内
//! "计算并发布" 一个不可变快照，读取方通过 `ArcSwap` 无锁读取。

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordination::{CoordinationClient, VersionCursor, VersionRecord, WatchOutcome};
use crate::discovery::config::SharedConfig;
use crate::discovery::instance::{DeploymentIdentifier, Node};
use crate::error::{DiscoveryError, Result};
use crate::health::{HealthRecord, HealthSink};
use crate::retry::FixedRetryPolicy;

/// 存放激活版本记录的 KV 目录
pub const VERSION_FOLDER: &str = "service";

/// 激活版本状态
#[derive(Debug, Clone, PartialEq, Eq, Default)]
enum ActiveVersion {
    /// 版本循环尚未返回
    #[default]
    Unknown,
    /// 没有版本记录，不做版本过滤
    Unversioned,
    Version(String),
}

impl ActiveVersion {
    fn as_filter(&self) -> Option<&str> {
        match self {
            ActiveVersion::Version(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct TimedError {
    error: DiscoveryError,
    at: DateTime<Utc>,
}

impl TimedError {
    fn now(error: DiscoveryError) -> Self {
        Self {
            error,
            at: Utc::now(),
        }
    }
}

/// 部署状态，仅由所属的监听器在锁内修改
#[derive(Debug, Default)]
struct DeploymentState {
    raw_nodes: Option<Vec<Node>>,
    active_version: ActiveVersion,
    undeployed: bool,
    health_error: Option<TimedError>,
    version_error: Option<TimedError>,
}

impl DeploymentState {
    /// 两个循环中最近一次的错误
    fn last_error(&self) -> Option<&TimedError> {
        match (&self.health_error, &self.version_error) {
            (Some(h), Some(v)) => Some(if v.at > h.at { v } else { h }),
            (Some(h), None) => Some(h),
            (None, v) => v.as_ref(),
        }
    }

    /// 由原始节点与激活版本推导过滤后的节点列表
    ///
    /// 节点内容未变化时复用上一个快照的 `Arc`，保证读取方看到的标识不变。
    fn reconcile(&self, deployment: &DeploymentIdentifier, previous: &NodeSnapshot) -> NodeSnapshot {
        let last_error = self.last_error().map(|e| e.error.clone());
        let last_error_at = self.last_error().map(|e| e.at);

        if self.undeployed {
            return NodeSnapshot {
                nodes: Arc::new(Vec::new()),
                error: None,
                undeployed: true,
                active_version: self.active_version.as_filter().map(str::to_string),
                total_nodes: 0,
                last_error,
                last_error_at,
            };
        }

        let raw = self.raw_nodes.as_deref().unwrap_or(&[]);

        // 激活版本从未读取成功：无法判断哪些节点可用，不返回未过滤的列表
        if let (ActiveVersion::Unknown, Some(version_error)) =
            (&self.active_version, &self.version_error)
        {
            return NodeSnapshot {
                nodes: Arc::new(Vec::new()),
                error: Some(version_error.error.clone()),
                undeployed: false,
                active_version: None,
                total_nodes: raw.len(),
                last_error,
                last_error_at,
            };
        }

        let active = self.active_version.as_filter();
        let filtered: Vec<Node> = raw
            .iter()
            .filter(|node| node.matches_version(active))
            .cloned()
            .collect();

        let error = if !filtered.is_empty() {
            None
        } else if let (Some(active), false) = (active, raw.is_empty()) {
            let mut available: Vec<String> = raw
                .iter()
                .map(|node| node.version.clone().unwrap_or_else(|| "<none>".to_string()))
                .collect();
            available.sort();
            available.dedup();
            Some(DiscoveryError::NoMatchingVersion {
                deployment: deployment.to_string(),
                active_version: active.to_string(),
                total_nodes: raw.len(),
                available_versions: available,
            })
        } else if let Some(last) = self.last_error() {
            Some(last.error.clone())
        } else {
            Some(DiscoveryError::NoNodes {
                deployment: deployment.to_string(),
            })
        };

        let nodes = if *previous.nodes == filtered {
            previous.nodes.clone()
        } else {
            Arc::new(filtered)
        };

        NodeSnapshot {
            nodes,
            error,
            undeployed: false,
            active_version: active.map(str::to_string),
            total_nodes: raw.len(),
            last_error,
            last_error_at,
        }
    }
}

/// 对外发布的不可变快照
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    /// 过滤后的节点
    pub nodes: Arc<Vec<Node>>,
    /// 过滤结果为空时的原因
    pub error: Option<DiscoveryError>,
    /// 部署已被标记为未部署
    pub undeployed: bool,
    pub active_version: Option<String>,
    /// 过滤前的节点数
    pub total_nodes: usize,
    /// 任一循环最近一次未恢复的错误
    pub last_error: Option<DiscoveryError>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl NodeSnapshot {
    fn empty() -> Self {
        Self {
            nodes: Arc::new(Vec::new()),
            error: None,
            undeployed: false,
            active_version: None,
            total_nodes: 0,
            last_error: None,
            last_error_at: None,
        }
    }
}

struct MonitorInner {
    deployment: DeploymentIdentifier,
    /// Consul 中的服务名（大小写以服务列表为准）
    consul_name: String,
    client: Arc<dyn CoordinationClient>,
    config: SharedConfig,
    health: Arc<dyn HealthSink>,
    state: Mutex<DeploymentState>,
    snapshot: ArcSwap<NodeSnapshot>,
    cancel: CancellationToken,
    health_ready: watch::Sender<bool>,
    version_ready: watch::Sender<bool>,
}

/// 单个部署的节点监听器
pub struct NodeMonitor {
    inner: Arc<MonitorInner>,
}

impl NodeMonitor {
    /// 启动监听器：立即在后台启动健康循环与版本循环
    ///
    /// `parent` 取消时监听器随之停止。
    pub fn start(
        deployment: DeploymentIdentifier,
        consul_name: impl Into<String>,
        client: Arc<dyn CoordinationClient>,
        config: SharedConfig,
        health: Arc<dyn HealthSink>,
        parent: &CancellationToken,
    ) -> Self {
        let (health_ready, _) = watch::channel(false);
        let (version_ready, _) = watch::channel(false);

        let inner = Arc::new(MonitorInner {
            deployment,
            consul_name: consul_name.into(),
            client,
            config,
            health,
            state: Mutex::new(DeploymentState::default()),
            snapshot: ArcSwap::from_pointee(NodeSnapshot::empty()),
            cancel: parent.child_token(),
            health_ready,
            version_ready,
        });

        info!(
            deployment = %inner.deployment,
            consul_service = %inner.consul_name,
            "Starting node monitor"
        );

        tokio::spawn(inner.clone().health_loop());
        tokio::spawn(inner.clone().version_loop());

        Self { inner }
    }

    /// 等待两个循环都至少产出一次结果（成功或失败）
    pub async fn init(&self) {
        let mut health = self.inner.health_ready.subscribe();
        let mut version = self.inner.version_ready.subscribe();

        tokio::select! {
            _ = self.inner.cancel.cancelled() => {}
            _ = async {
                let _ = health.wait_for(|ready| *ready).await;
                let _ = version.wait_for(|ready| *ready).await;
            } => {}
        }
    }

    pub fn deployment(&self) -> &DeploymentIdentifier {
        &self.inner.deployment
    }

    /// 当前过滤后的节点
    ///
    /// 列表为空且记录了错误时返回错误，让尚未收敛的状态暴露原因。
    pub fn nodes(&self) -> Result<Arc<Vec<Node>>> {
        let snapshot = self.inner.snapshot.load();
        if !snapshot.nodes.is_empty() {
            return Ok(snapshot.nodes.clone());
        }
        match &snapshot.error {
            Some(err) => Err(err.clone()),
            None => Ok(snapshot.nodes.clone()),
        }
    }

    /// 当前快照
    pub fn snapshot(&self) -> Arc<NodeSnapshot> {
        self.inner.snapshot.load_full()
    }

    pub fn is_undeployed(&self) -> bool {
        self.inner.snapshot.load().undeployed
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// 停止两个循环；进行中的长轮询会立即返回
    pub fn dispose(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.health.remove(&self.inner.component());
        info!(deployment = %self.inner.deployment, "Node monitor disposed");
    }
}

impl Drop for NodeMonitor {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl MonitorInner {
    fn component(&self) -> String {
        format!("discovery:{}", self.deployment)
    }

    /// 在锁内修改状态、计算并发布新快照
    fn update(&self, mutate: impl FnOnce(&mut DeploymentState)) {
        let snapshot = {
            let mut state = self.state.lock();
            mutate(&mut state);
            let previous = self.snapshot.load();
            let snapshot = Arc::new(state.reconcile(&self.deployment, &previous));
            let changed = !Arc::ptr_eq(&previous.nodes, &snapshot.nodes);
            self.snapshot.store(snapshot.clone());
            if changed {
                info!(
                    deployment = %self.deployment,
                    nodes = snapshot.nodes.len(),
                    total_nodes = snapshot.total_nodes,
                    active_version = ?snapshot.active_version,
                    "Deployment nodes updated"
                );
            }
            snapshot
        };
        self.publish_health(&snapshot);
    }

    fn publish_health(&self, snapshot: &NodeSnapshot) {
        if self.cancel.is_cancelled() {
            return;
        }
        let record = if snapshot.undeployed {
            HealthRecord::healthy("not deployed")
        } else if let Some(err) = &snapshot.error {
            HealthRecord::unhealthy(err.to_string())
        } else if let Some(err) = &snapshot.last_error {
            HealthRecord::unhealthy(format!(
                "serving {} last known node(s), coordination store error: {}",
                snapshot.nodes.len(),
                err
            ))
        } else {
            let version = snapshot.active_version.as_deref().unwrap_or("any");
            HealthRecord::healthy(format!(
                "{} of {} node(s) serve version {}",
                snapshot.nodes.len(),
                snapshot.total_nodes,
                version
            ))
        };
        self.health.publish(&self.component(), record);
    }

    fn retry_policy(&self) -> FixedRetryPolicy {
        FixedRetryPolicy::new(self.config.load().error_retry_interval())
    }

    /// 应答是否带来了新的游标
    ///
    /// 404 不带索引头时游标为 0，存储不会阻塞下一次请求，需要按重试间隔放慢轮询。
    fn cursor_advanced(&self, previous: VersionCursor, returned: VersionCursor) -> bool {
        !returned.is_zero() && returned != previous
    }

    /// 休眠到指定时刻；被取消时返回 false
    async fn pause_until(&self, deadline: Instant) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep_until(deadline) => true,
        }
    }

    async fn health_loop(self: Arc<Self>) {
        let mut cursor = VersionCursor::ZERO;
        let mut has_data = false;

        while !self.cancel.is_cancelled() {
            let result = self
                .client
                .watch_health(&self.consul_name, &self.deployment.zone, cursor, &self.cancel)
                .await;
            if self.cancel.is_cancelled() {
                break;
            }

            let previous = cursor;
            match result.outcome {
                WatchOutcome::Data(nodes) => {
                    cursor = previous.advance(result.cursor);
                    if has_data && !previous.is_zero() && result.cursor == previous {
                        debug!(deployment = %self.deployment, cursor = %cursor, "Node health unchanged");
                        if self.state.lock().health_error.is_some() {
                            self.update(|state| state.health_error = None);
                        }
                    } else {
                        has_data = true;
                        self.update(|state| {
                            state.raw_nodes = Some(nodes);
                            state.undeployed = false;
                            state.health_error = None;
                        });
                    }
                }
                WatchOutcome::Undeployed => {
                    let at = Instant::now();
                    cursor = previous.advance(result.cursor);
                    has_data = false;
                    self.update(|state| {
                        state.undeployed = true;
                        state.health_error = None;
                    });
                    if !self.cursor_advanced(previous, result.cursor) {
                        self.health_ready.send_replace(true);
                        if !self.pause_until(self.retry_policy().retry_at(at)).await {
                            break;
                        }
                        continue;
                    }
                }
                WatchOutcome::Failed(error) => {
                    let at = Instant::now();
                    warn!(
                        deployment = %self.deployment,
                        error = %error,
                        "Node health watch failed, keeping last known nodes"
                    );
                    self.update(|state| state.health_error = Some(TimedError::now(error)));
                    self.health_ready.send_replace(true);
                    if !self.pause_until(self.retry_policy().retry_at(at)).await {
                        break;
                    }
                    continue;
                }
            }
            self.health_ready.send_replace(true);
        }

        debug!(deployment = %self.deployment, "Node health loop stopped");
    }

    async fn version_loop(self: Arc<Self>) {
        let mut cursor = VersionCursor::ZERO;

        while !self.cancel.is_cancelled() {
            let result = self
                .client
                .watch_key(
                    VERSION_FOLDER,
                    &self.consul_name,
                    &self.deployment.zone,
                    cursor,
                    &self.cancel,
                )
                .await
                .decode_json::<VersionRecord>();
            if self.cancel.is_cancelled() {
                break;
            }

            let previous = cursor;
            match result.outcome {
                WatchOutcome::Data(record) => {
                    cursor = previous.advance(result.cursor);
                    let active = match record.as_ref().and_then(VersionRecord::active_version) {
                        Some(version) => ActiveVersion::Version(version.to_string()),
                        None => ActiveVersion::Unversioned,
                    };
                    self.set_active_version(active);
                }
                WatchOutcome::Undeployed => {
                    let at = Instant::now();
                    cursor = previous.advance(result.cursor);
                    self.set_active_version(ActiveVersion::Unversioned);
                    if !self.cursor_advanced(previous, result.cursor) {
                        self.version_ready.send_replace(true);
                        if !self.pause_until(self.retry_policy().retry_at(at)).await {
                            break;
                        }
                        continue;
                    }
                }
                WatchOutcome::Failed(error) => {
                    let at = Instant::now();
                    warn!(
                        deployment = %self.deployment,
                        error = %error,
                        "Active version watch failed, keeping last known version"
                    );
                    self.update(|state| state.version_error = Some(TimedError::now(error)));
                    self.version_ready.send_replace(true);
                    if !self.pause_until(self.retry_policy().retry_at(at)).await {
                        break;
                    }
                    continue;
                }
            }
            self.version_ready.send_replace(true);
        }

        debug!(deployment = %self.deployment, "Active version loop stopped");
    }

    fn set_active_version(&self, active: ActiveVersion) {
        let unchanged = {
            let state = self.state.lock();
            state.active_version == active && state.version_error.is_none()
        };
        if unchanged {
            return;
        }
        if let ActiveVersion::Version(version) = &active {
            info!(deployment = %self.deployment, version = %version, "Active version changed");
        }
        self.update(|state| {
            state.active_version = active;
            state.version_error = None;
        });
    }
}
