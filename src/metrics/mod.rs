//! 指标收集模块

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// 指标数据快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metrics {
    pub watch_requests: u64,
    pub watch_failures: u64,
    pub watch_undeployed: u64,
    pub sources_created: u64,
    pub sources_disposed: u64,
    pub cache_evictions: u64,
    pub reachability_episodes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    watch_requests: AtomicU64,
    watch_failures: AtomicU64,
    watch_undeployed: AtomicU64,
    sources_created: AtomicU64,
    sources_disposed: AtomicU64,
    cache_evictions: AtomicU64,
    reachability_episodes: AtomicU64,
}

/// 指标收集器
///
/// 只做计数，导出由宿主进程负责。
#[derive(Clone, Default)]
pub struct MetricsCollector {
    counters: Arc<Counters>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次长轮询请求
    pub fn record_watch(&self, failed: bool, undeployed: bool) {
        self.counters.watch_requests.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.counters.watch_failures.fetch_add(1, Ordering::Relaxed);
        }
        if undeployed {
            self.counters.watch_undeployed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_source_created(&self) {
        self.counters.sources_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_source_disposed(&self) {
        self.counters.sources_disposed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.counters.cache_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reachability_episode(&self) {
        self.counters
            .reachability_episodes
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics(&self) -> Metrics {
        let c = &self.counters;
        Metrics {
            watch_requests: c.watch_requests.load(Ordering::Relaxed),
            watch_failures: c.watch_failures.load(Ordering::Relaxed),
            watch_undeployed: c.watch_undeployed.load(Ordering::Relaxed),
            sources_created: c.sources_created.load(Ordering::Relaxed),
            sources_disposed: c.sources_disposed.load(Ordering::Relaxed),
            cache_evictions: c.cache_evictions.load(Ordering::Relaxed),
            reachability_episodes: c.reachability_episodes.load(Ordering::Relaxed),
        }
    }
}
