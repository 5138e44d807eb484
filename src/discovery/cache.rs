//! 服务发现缓存
//!
//! 按部署标识缓存节点来源：
//! - 同一部署的并发首次请求只构造一次来源（共享同一个构造 future）
//! - 构造失败不会被缓存，下一次请求重新构造
//! - 来源类型配置变更、部署消失 / 重新出现时按工厂的部署状态替换来源
//! - 空闲超过生命周期的条目由后台任务淘汰并释放

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::config::{NodeSourceKind, SharedConfig};
use crate::discovery::factory::{DeploymentStatus, NodeSourceFactory};
use crate::discovery::instance::{DeploymentIdentifier, Node};
use crate::discovery::source::NodeSource;
use crate::error::{DiscoveryError, Result};
use crate::metrics::MetricsCollector;

type SourceResult = std::result::Result<Option<Arc<dyn NodeSource>>, DiscoveryError>;
type SourceFuture = Shared<BoxFuture<'static, SourceResult>>;

/// 缓存槽位：一次构造过程（可能仍在进行中）
#[derive(Clone)]
struct CacheEntry {
    generation: u64,
    kind: NodeSourceKind,
    source: SourceFuture,
}

/// 需要替换已有来源的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StaleReason {
    /// 配置的来源类型已变化
    Deprecated,
    /// 来源报告部署已消失
    Undeployed,
    /// 构造时部署不存在
    NotDeployed,
}

enum Replacement {
    Installed {
        fresh: CacheEntry,
        stale: Option<Arc<dyn NodeSource>>,
    },
    /// 另一个调用方已先完成替换
    Concurrent(CacheEntry),
    /// 工厂状态不允许替换，保持原样
    Skipped,
}

struct CacheInner {
    factories: HashMap<NodeSourceKind, Arc<dyn NodeSourceFactory>>,
    config: SharedConfig,
    entries: DashMap<DeploymentIdentifier, CacheEntry>,
    last_requested: DashMap<DeploymentIdentifier, Instant>,
    /// 替换与淘汰互斥
    replace_lock: Mutex<()>,
    generation: AtomicU64,
    metrics: MetricsCollector,
    cancel: CancellationToken,
}

/// 服务发现缓存（可克隆的句柄）
#[derive(Clone)]
pub struct DiscoveryCache {
    inner: Arc<CacheInner>,
}

impl DiscoveryCache {
    /// 创建缓存并启动空闲淘汰任务
    pub fn new(
        factories: Vec<Arc<dyn NodeSourceFactory>>,
        config: SharedConfig,
        metrics: MetricsCollector,
        parent: &CancellationToken,
    ) -> Self {
        let factories = factories
            .into_iter()
            .map(|factory| (factory.kind(), factory))
            .collect();

        let inner = Arc::new(CacheInner {
            factories,
            config,
            entries: DashMap::new(),
            last_requested: DashMap::new(),
            replace_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            metrics,
            cancel: parent.child_token(),
        });

        tokio::spawn(sweep_loop(Arc::downgrade(&inner), inner.cancel.clone()));
        Self { inner }
    }

    /// 获取部署的节点列表
    ///
    /// 返回 `Ok(None)` 表示部署不存在。
    pub async fn get_nodes(&self, deployment: &DeploymentIdentifier) -> Result<Option<Arc<Vec<Node>>>> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(DiscoveryError::Disposed("discovery cache".to_string()));
        }

        inner.last_requested.insert(deployment.clone(), Instant::now());
        let kind = inner.config.load().source_kind_for(&deployment.service_name);

        let entry = inner
            .entries
            .entry(deployment.clone())
            .or_insert_with(|| inner.new_entry(kind, deployment))
            .clone();
        let source = inner.resolve(&entry, deployment).await?;

        let reason = match &source {
            _ if entry.kind != kind => Some(StaleReason::Deprecated),
            Some(s) if !s.is_deployed() => Some(StaleReason::Undeployed),
            Some(_) => None,
            None => Some(StaleReason::NotDeployed),
        };
        let Some(reason) = reason else {
            return Self::serve(source);
        };

        match inner.try_replace(deployment, &entry, kind, reason, source.as_ref()) {
            Replacement::Installed { fresh, stale } => {
                let replaced = inner.resolve(&fresh, deployment).await;
                if let Some(stale) = stale {
                    info!(
                        deployment = %deployment,
                        reason = ?reason,
                        old_kind = %stale.kind(),
                        new_kind = %kind,
                        "Replaced node source"
                    );
                    stale.dispose();
                }
                Self::serve(replaced?)
            }
            Replacement::Concurrent(current) => Self::serve(inner.resolve(&current, deployment).await?),
            Replacement::Skipped => Self::serve(source),
        }
    }

    fn serve(source: Option<Arc<dyn NodeSource>>) -> Result<Option<Arc<Vec<Node>>>> {
        match source {
            Some(source) if source.is_deployed() => source.nodes().map(Some),
            _ => Ok(None),
        }
    }

    /// 当前缓存的部署数
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn contains(&self, deployment: &DeploymentIdentifier) -> bool {
        self.inner.entries.contains_key(deployment)
    }

    /// 立即淘汰空闲条目，返回淘汰数量
    pub fn evict_idle(&self) -> usize {
        self.inner.sweep(Instant::now())
    }

    /// 停止淘汰任务并释放所有来源
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return;
        }
        inner.cancel.cancel();

        let _guard = inner.replace_lock.lock();
        let deployments: Vec<DeploymentIdentifier> =
            inner.entries.iter().map(|e| e.key().clone()).collect();
        for deployment in deployments {
            if let Some((_, entry)) = inner.entries.remove(&deployment) {
                inner.dispose_entry(entry);
            }
        }
        inner.last_requested.clear();
        for factory in inner.factories.values() {
            factory.dispose();
        }
        info!("Discovery cache shut down");
    }
}

impl CacheInner {
    fn new_entry(&self, kind: NodeSourceKind, deployment: &DeploymentIdentifier) -> CacheEntry {
        let factory = self.factories.get(&kind).cloned();
        let deployment = deployment.clone();

        let source = async move {
            let factory = factory.ok_or_else(|| {
                DiscoveryError::config(format!("no node source factory registered for '{}'", kind))
            })?;
            factory.create(&deployment).await
        }
        .boxed()
        .shared();

        CacheEntry {
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
            kind,
            source,
        }
    }

    /// 等待槽位的构造结果；失败时移除该槽位（若未被替换），下一次请求重新构造
    async fn resolve(&self, entry: &CacheEntry, deployment: &DeploymentIdentifier) -> SourceResult {
        match entry.source.clone().await {
            Ok(source) => Ok(source),
            Err(error) => {
                let removed = self
                    .entries
                    .remove_if(deployment, |_, current| current.generation == entry.generation);
                if removed.is_some() {
                    debug!(deployment = %deployment, error = %error, "Node source construction failed, not cached");
                }
                Err(error)
            }
        }
    }

    fn try_replace(
        &self,
        deployment: &DeploymentIdentifier,
        observed: &CacheEntry,
        kind: NodeSourceKind,
        reason: StaleReason,
        stale: Option<&Arc<dyn NodeSource>>,
    ) -> Replacement {
        let Some(factory) = self.factories.get(&kind) else {
            warn!(deployment = %deployment, kind = %kind, "No factory for configured node source");
            return Replacement::Skipped;
        };

        // 来源类型变化时总是替换：新工厂的构造过程自己判断部署是否存在
        if reason != StaleReason::Deprecated {
            match factory.deployment_status(deployment) {
                DeploymentStatus::Deployed => {}
                // 未收敛时不动已有条目；部署不存在时保留现有槽位作为 "未部署" 标记，不反复重建
                DeploymentStatus::Unknown | DeploymentStatus::NotDeployed => {
                    return Replacement::Skipped;
                }
            }
        }

        let _guard = self.replace_lock.lock();
        if let Some(current) = self.entries.get(deployment).map(|e| e.clone()) {
            if current.generation != observed.generation {
                return Replacement::Concurrent(current);
            }
        }

        let fresh = self.new_entry(kind, deployment);
        self.entries.insert(deployment.clone(), fresh.clone());
        debug!(
            deployment = %deployment,
            reason = ?reason,
            old_kind = %observed.kind,
            new_kind = %kind,
            "Installing new node source"
        );
        Replacement::Installed {
            fresh,
            stale: stale.cloned(),
        }
    }

    /// 释放槽位中的来源；构造仍在进行时等待其完成后释放
    fn dispose_entry(&self, entry: CacheEntry) {
        match entry.source.peek() {
            Some(Ok(Some(source))) => source.dispose(),
            Some(_) => {}
            None => {
                tokio::spawn(async move {
                    if let Ok(Some(source)) = entry.source.await {
                        source.dispose();
                    }
                });
            }
        }
    }

    fn sweep(&self, now: Instant) -> usize {
        let lifetime = self.config.load().cache_idle_lifetime();
        let is_idle = |at: &Instant| now.saturating_duration_since(*at) > lifetime;

        let candidates: Vec<DeploymentIdentifier> = self
            .last_requested
            .iter()
            .filter(|e| is_idle(e.value()))
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for deployment in candidates {
            let _guard = self.replace_lock.lock();
            // 扫描期间可能有新的请求，只移除仍然空闲的时间戳
            if self
                .last_requested
                .remove_if(&deployment, |_, at| is_idle(at))
                .is_none()
            {
                continue;
            }
            if let Some((_, entry)) = self.entries.remove(&deployment) {
                self.dispose_entry(entry);
                self.metrics.record_eviction();
                evicted += 1;
                info!(deployment = %deployment, "Evicted idle deployment from discovery cache");
            }
        }
        evicted
    }
}

async fn sweep_loop(inner: Weak<CacheInner>, cancel: CancellationToken) {
    loop {
        let interval = match inner.upgrade() {
            Some(inner) => inner.config.load().cache_sweep_interval(),
            None => break,
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        match inner.upgrade() {
            Some(inner) => {
                inner.sweep(Instant::now());
            }
            None => break,
        }
    }
    debug!("Discovery cache sweep loop stopped");
}
