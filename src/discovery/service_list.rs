//! 已部署服务列表监听器
//!
//! 长轮询 `service/` 目录下的键，得到当前已部署的 Consul 服务名集合。
//! 工厂在构造节点监听器之前先查询这里，避免为尚未部署的目标创建监听器。

use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordination::{CoordinationClient, VersionCursor, WatchOutcome};
use crate::discovery::config::SharedConfig;
use crate::discovery::node_monitor::VERSION_FOLDER;
use crate::error::DiscoveryError;
use crate::health::{HealthRecord, HealthSink};
use crate::retry::FixedRetryPolicy;

/// 服务列表快照
#[derive(Debug, Clone, Default)]
pub struct ServiceListSnapshot {
    pub services: Arc<HashSet<String>>,
    /// 集合每变化一次加一
    pub change_count: u64,
    /// 至少收到过一次成功响应
    pub converged: bool,
    pub error: Option<DiscoveryError>,
    /// 仅大小写不同的服务名分组
    pub case_collisions: Vec<Vec<String>>,
}

struct ServiceListInner {
    zone: String,
    client: Arc<dyn CoordinationClient>,
    config: SharedConfig,
    health: Arc<dyn HealthSink>,
    snapshot: ArcSwap<ServiceListSnapshot>,
    cancel: CancellationToken,
    ready: watch::Sender<bool>,
}

/// 已部署服务列表监听器
pub struct ServiceListMonitor {
    inner: Arc<ServiceListInner>,
}

impl ServiceListMonitor {
    /// 启动监听循环
    pub fn start(
        zone: impl Into<String>,
        client: Arc<dyn CoordinationClient>,
        config: SharedConfig,
        health: Arc<dyn HealthSink>,
        parent: &CancellationToken,
    ) -> Self {
        let (ready, _) = watch::channel(false);
        let inner = Arc::new(ServiceListInner {
            zone: zone.into(),
            client,
            config,
            health,
            snapshot: ArcSwap::from_pointee(ServiceListSnapshot::default()),
            cancel: parent.child_token(),
            ready,
        });

        tokio::spawn(inner.clone().watch_loop());
        Self { inner }
    }

    /// 等待第一次结果（成功或失败）
    pub async fn init(&self) {
        let mut ready = self.inner.ready.subscribe();
        tokio::select! {
            _ = self.inner.cancel.cancelled() => {}
            _ = ready.wait_for(|r| *r) => {}
        }
    }

    pub fn snapshot(&self) -> Arc<ServiceListSnapshot> {
        self.inner.snapshot.load_full()
    }

    /// 当前已部署的服务名
    pub fn services(&self) -> Arc<HashSet<String>> {
        self.inner.snapshot.load().services.clone()
    }

    pub fn change_count(&self) -> u64 {
        self.inner.snapshot.load().change_count
    }

    pub fn is_converged(&self) -> bool {
        self.inner.snapshot.load().converged
    }

    /// 最近一次失败（收敛后成功响应会清除）
    pub fn last_error(&self) -> Option<DiscoveryError> {
        self.inner.snapshot.load().error.clone()
    }

    pub fn is_service_deployed(&self, consul_name: &str) -> bool {
        self.resolve_service_name(consul_name).is_some()
    }

    /// 以存储中的大小写解析服务名
    ///
    /// 精确匹配优先；否则接受唯一的大小写不敏感匹配。多个候选仅大小写不同时视为未部署
    /// （配置缺陷已通过健康记录暴露）。
    pub fn resolve_service_name(&self, consul_name: &str) -> Option<String> {
        let snapshot = self.inner.snapshot.load();
        if snapshot.services.contains(consul_name) {
            return Some(consul_name.to_string());
        }
        let mut candidates = snapshot
            .services
            .iter()
            .filter(|name| name.eq_ignore_ascii_case(consul_name));
        match (candidates.next(), candidates.next()) {
            (Some(name), None) => Some(name.clone()),
            _ => None,
        }
    }

    pub fn dispose(&self) {
        self.inner.cancel.cancel();
        self.inner.health.remove(&self.inner.component());
    }
}

impl Drop for ServiceListMonitor {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

/// 找出仅大小写不同的服务名
fn find_case_collisions(services: &HashSet<String>) -> Vec<Vec<String>> {
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    for name in services {
        groups.entry(name.to_lowercase()).or_default().push(name.clone());
    }
    let mut collisions: Vec<Vec<String>> = groups
        .into_values()
        .filter(|group| group.len() > 1)
        .map(|mut group| {
            group.sort();
            group
        })
        .collect();
    collisions.sort();
    collisions
}

impl ServiceListInner {
    fn component(&self) -> String {
        if self.zone.is_empty() {
            "discovery:service-list".to_string()
        } else {
            format!("discovery:service-list@{}", self.zone)
        }
    }

    fn publish(&self, services: Option<HashSet<String>>, error: Option<DiscoveryError>) {
        let previous = self.snapshot.load_full();
        let mut next = (*previous).clone();

        if let Some(services) = services {
            if !next.converged || *next.services != services {
                next.change_count += 1;
                next.case_collisions = find_case_collisions(&services);
                info!(
                    zone = %self.zone,
                    services = services.len(),
                    change_count = next.change_count,
                    "Deployed service list updated"
                );
                next.services = Arc::new(services);
            }
            next.converged = true;
        }
        next.error = error;
        self.snapshot.store(Arc::new(next.clone()));

        let record = if let Some(err) = &next.error {
            HealthRecord::unhealthy(err.to_string())
        } else if !next.case_collisions.is_empty() {
            let groups: Vec<String> = next
                .case_collisions
                .iter()
                .map(|group| format!("[{}]", group.join(", ")))
                .collect();
            warn!(zone = %self.zone, collisions = %groups.join(" "), "Service names collide by case");
            HealthRecord::unhealthy(format!(
                "service names differ only by case: {}",
                groups.join(" ")
            ))
        } else {
            HealthRecord::healthy(format!("{} deployed service(s)", next.services.len()))
        };
        self.health.publish(&self.component(), record);
    }

    async fn watch_loop(self: Arc<Self>) {
        let mut cursor = VersionCursor::ZERO;

        while !self.cancel.is_cancelled() {
            let result = self
                .client
                .list_keys(VERSION_FOLDER, &self.zone, cursor, &self.cancel)
                .await;
            if self.cancel.is_cancelled() {
                break;
            }

            let previous = cursor;
            match result.outcome {
                WatchOutcome::Data(names) => {
                    cursor = previous.advance(result.cursor);
                    let converged = self.snapshot.load().converged;
                    if converged && !previous.is_zero() && result.cursor == previous {
                        debug!(zone = %self.zone, "Service list unchanged");
                        if self.snapshot.load().error.is_some() {
                            self.publish(None, None);
                        }
                    } else {
                        self.publish(Some(names.into_iter().collect()), None);
                    }
                }
                WatchOutcome::Undeployed => {
                    // 目录下没有任何键
                    let at = Instant::now();
                    cursor = previous.advance(result.cursor);
                    self.publish(Some(HashSet::new()), None);
                    if result.cursor.is_zero() || result.cursor == previous {
                        // 没有新游标时存储不会阻塞，按重试间隔继续轮询
                        self.ready.send_replace(true);
                        let retry_at = FixedRetryPolicy::new(self.config.load().error_retry_interval())
                            .retry_at(at);
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep_until(retry_at) => {}
                        }
                        continue;
                    }
                }
                WatchOutcome::Failed(error) => {
                    let at = Instant::now();
                    warn!(zone = %self.zone, error = %error, "Service list watch failed");
                    self.publish(None, Some(error));
                    self.ready.send_replace(true);
                    let retry_at = FixedRetryPolicy::new(self.config.load().error_retry_interval())
                        .retry_at(at);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep_until(retry_at) => {}
                    }
                    continue;
                }
            }
            self.ready.send_replace(true);
        }

        debug!(zone = %self.zone, "Service list loop stopped");
    }
}
