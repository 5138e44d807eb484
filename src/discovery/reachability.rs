//! 节点可达性跟踪
//!
//! 调用方报告节点不可达后，跟踪器启动一轮（至多一轮）后台检查：
//! 按指数退避反复调用检查函数，直到成功或被停止。成功后节点重新可达并回调通知。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::instance::Node;
use crate::metrics::MetricsCollector;
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};

/// 可达性检查
#[async_trait]
pub trait ReachabilityCheck: Send + Sync {
    /// 节点可达时返回 `Ok(())`
    async fn check(&self, node: &Node) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// 基于 TCP 连接的可达性检查
#[derive(Debug, Clone, Copy)]
pub struct TcpReachabilityCheck {
    connect_timeout: Duration,
}

impl TcpReachabilityCheck {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpReachabilityCheck {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[async_trait]
impl ReachabilityCheck for TcpReachabilityCheck {
    async fn check(&self, node: &Node) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Some(port) = node.port else {
            return Err(format!("node {} has no port to probe", node.hostname).into());
        };
        match timeout(self.connect_timeout, TcpStream::connect((node.hostname.as_str(), port))).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(format!(
                "connect to {} timed out after {}ms",
                node.endpoint(),
                self.connect_timeout.as_millis()
            )
            .into()),
        }
    }
}

/// 节点重新可达时的回调
pub type ReachableCallback = Arc<dyn Fn(&Node) + Send + Sync>;

/// 可达性状态快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReachabilityStatus {
    pub reachable: bool,
    pub last_error: Option<String>,
    /// 本轮已失败的检查次数
    pub failed_attempts: usize,
    pub next_retry_delay: Duration,
    pub checking: bool,
}

#[derive(Debug)]
struct TrackerState {
    reachable: bool,
    last_error: Option<String>,
    failed_attempts: usize,
    next_retry_delay: Duration,
    episode: Option<CancellationToken>,
}

/// 单个节点的可达性跟踪器
pub struct NodeReachabilityTracker {
    node: Node,
    check: Arc<dyn ReachabilityCheck>,
    backoff: ExponentialBackoffPolicy,
    on_reachable: ReachableCallback,
    state: Mutex<TrackerState>,
    cancel: CancellationToken,
    metrics: MetricsCollector,
}

impl NodeReachabilityTracker {
    /// 创建跟踪器，初始为可达
    pub fn new(
        node: Node,
        check: Arc<dyn ReachabilityCheck>,
        on_reachable: ReachableCallback,
        metrics: MetricsCollector,
        parent: &CancellationToken,
    ) -> Self {
        let backoff = ExponentialBackoffPolicy::reachability();
        Self {
            node,
            check,
            backoff,
            on_reachable,
            state: Mutex::new(TrackerState {
                reachable: true,
                last_error: None,
                failed_attempts: 0,
                next_retry_delay: backoff.backoff_duration(0),
                episode: None,
            }),
            cancel: parent.child_token(),
            metrics,
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn is_reachable(&self) -> bool {
        self.state.lock().reachable
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub fn status(&self) -> ReachabilityStatus {
        let state = self.state.lock();
        ReachabilityStatus {
            reachable: state.reachable,
            last_error: state.last_error.clone(),
            failed_attempts: state.failed_attempts,
            next_retry_delay: state.next_retry_delay,
            checking: state.episode.is_some(),
        }
    }

    /// 报告节点不可达
    ///
    /// 节点立即标记为不可达；已有检查在进行时不会再启动新的一轮。
    /// 返回是否启动了新的一轮检查。
    pub fn report_unreachable(self: &Arc<Self>, error: Option<String>) -> bool {
        let episode = {
            let mut state = self.state.lock();
            state.reachable = false;
            if error.is_some() {
                state.last_error = error;
            }
            if state.episode.is_some() || self.cancel.is_cancelled() {
                return false;
            }
            let token = self.cancel.child_token();
            state.episode = Some(token.clone());
            state.failed_attempts = 0;
            state.next_retry_delay = self.backoff.backoff_duration(0);
            token
        };

        self.metrics.record_reachability_episode();
        warn!(
            node = %self.node,
            error = ?self.last_error(),
            "Node reported unreachable, starting reachability checks"
        );
        tokio::spawn(self.clone().run_episode(episode));
        true
    }

    /// 停止进行中的检查，不改变可达状态
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn run_episode(self: Arc<Self>, episode: CancellationToken) {
        let mut attempt = 0usize;
        loop {
            let delay = self.backoff.backoff_duration(attempt);
            self.state.lock().next_retry_delay = delay;

            tokio::select! {
                _ = episode.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let outcome = tokio::select! {
                _ = episode.cancelled() => break,
                outcome = self.check.check(&self.node) => outcome,
            };

            match outcome {
                Ok(()) => {
                    {
                        let mut state = self.state.lock();
                        if episode.is_cancelled() {
                            return;
                        }
                        state.reachable = true;
                        state.last_error = None;
                        state.failed_attempts = 0;
                        state.next_retry_delay = self.backoff.backoff_duration(0);
                        state.episode = None;
                    }
                    info!(node = %self.node, attempts = attempt + 1, "Node is reachable again");
                    (self.on_reachable)(&self.node);
                    return;
                }
                Err(e) => {
                    let mut state = self.state.lock();
                    state.failed_attempts = attempt + 1;
                    state.last_error = Some(e.to_string());
                    debug!(node = %self.node, attempt = attempt + 1, error = %e, "Reachability check failed");
                }
            }
            attempt = attempt.saturating_add(1);
        }

        debug!(node = %self.node, "Reachability checks stopped");
    }
}

impl Drop for NodeReachabilityTracker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
