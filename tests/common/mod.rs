//! 测试公共工具
//!
//! `FakeStore` 是内存中的协调存储，按真实的阻塞查询语义工作：
//! 游标与资源的修改索引相同时阻塞，直到资源变化或等待超时。

#![allow(dead_code)]

use async_trait::async_trait;
use flare_discovery::coordination::{CoordinationClient, VersionCursor, WatchOutcome, WatchResult};
use flare_discovery::error::{DiscoveryError, RequestContext};
use flare_discovery::{DiscoveryConfig, Node, SharedConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const STORE_ADDRESS: &str = "fake://store";

#[derive(Default)]
struct StoreState {
    index: u64,
    /// Consul 服务名 -> 通过健康检查的节点
    health: HashMap<String, Vec<Node>>,
    /// 完整键 -> 值
    keys: HashMap<String, Option<Vec<u8>>>,
    /// 资源 -> 最近修改索引
    modified: HashMap<String, u64>,
    outage: bool,
    /// 只让 KV 请求失败
    key_outage: bool,
    health_calls: HashMap<String, usize>,
}

impl StoreState {
    fn touch(&mut self, resource: String) {
        self.index += 1;
        let index = self.index;
        self.modified.insert(resource, index);
    }

    fn modify_index(&self, resource: &str) -> u64 {
        self.modified.get(resource).copied().unwrap_or(1)
    }
}

/// 内存协调存储
pub struct FakeStore {
    state: Mutex<StoreState>,
    changed: Notify,
    wait: Duration,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Self::with_wait(Duration::from_millis(200))
    }

    pub fn with_wait(wait: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StoreState {
                index: 1,
                ..Default::default()
            }),
            changed: Notify::new(),
            wait,
        })
    }

    fn mutate(&self, f: impl FnOnce(&mut StoreState)) {
        f(&mut self.state.lock());
        self.changed.notify_waiters();
    }

    /// 部署服务：写入版本键与健康节点
    pub fn deploy(&self, consul_name: &str, nodes: Vec<Node>) {
        self.mutate(|state| {
            state.keys.insert(format!("service/{}", consul_name), None);
            state.touch(format!("kv/service/{}", consul_name));
            state.touch("list/service".to_string());
            state.health.insert(consul_name.to_string(), nodes);
            state.touch(format!("health/{}", consul_name));
        });
    }

    pub fn set_nodes(&self, consul_name: &str, nodes: Vec<Node>) {
        self.mutate(|state| {
            state.health.insert(consul_name.to_string(), nodes);
            state.touch(format!("health/{}", consul_name));
        });
    }

    pub fn set_version(&self, consul_name: &str, version: Option<&str>) {
        let value = version.map(|v| format!(r#"{{"version":"{}"}}"#, v).into_bytes());
        self.mutate(|state| {
            state.keys.insert(format!("service/{}", consul_name), value);
            state.touch(format!("kv/service/{}", consul_name));
        });
    }

    /// 移除服务：版本键与健康节点都消失
    pub fn undeploy(&self, consul_name: &str) {
        self.mutate(|state| {
            state.keys.remove(&format!("service/{}", consul_name));
            state.touch(format!("kv/service/{}", consul_name));
            state.touch("list/service".to_string());
            state.health.remove(consul_name);
            state.touch(format!("health/{}", consul_name));
        });
    }

    pub fn set_outage(&self, outage: bool) {
        self.mutate(|state| state.outage = outage);
    }

    pub fn set_key_outage(&self, outage: bool) {
        self.mutate(|state| state.key_outage = outage);
    }

    pub fn health_calls(&self, consul_name: &str) -> usize {
        self.state
            .lock()
            .health_calls
            .get(consul_name)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_health_calls(&self) -> usize {
        self.state.lock().health_calls.values().sum()
    }

    /// 阻塞查询：`read` 返回资源当前的 (修改索引, 结果)
    async fn blocking_query<T>(
        &self,
        target: &str,
        resource: &str,
        cursor: VersionCursor,
        cancel: &CancellationToken,
        read: impl Fn(&StoreState) -> WatchOutcome<T>,
    ) -> WatchResult<T> {
        let context = RequestContext::new(target, format!("{}/{}", STORE_ADDRESS, resource), STORE_ADDRESS);
        let deadline = Instant::now() + self.wait;

        loop {
            let notified = self.changed.notified();
            let (index, outcome, outage) = {
                let state = self.state.lock();
                (state.modify_index(resource), read(&state), state.outage)
            };

            if outage {
                return WatchResult::failed(
                    DiscoveryError::transient(context.clone(), "connection refused"),
                    context,
                );
            }
            if cursor.0 != index || Instant::now() >= deadline {
                return WatchResult {
                    outcome,
                    cursor: VersionCursor(index),
                    context: context.with_response(200, ""),
                    raw_response: String::new(),
                };
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return WatchResult::failed(DiscoveryError::Disposed(format!("watch on {}", target)), context);
                }
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }
}

#[async_trait]
impl CoordinationClient for FakeStore {
    async fn watch_health(
        &self,
        service: &str,
        _zone: &str,
        cursor: VersionCursor,
        cancel: &CancellationToken,
    ) -> WatchResult<Vec<Node>> {
        *self
            .state
            .lock()
            .health_calls
            .entry(service.to_string())
            .or_default() += 1;

        let resource = format!("health/{}", service);
        self.blocking_query(service, &resource, cursor, cancel, |state| {
            match state.health.get(service) {
                Some(nodes) => WatchOutcome::Data(nodes.clone()),
                None => WatchOutcome::Undeployed,
            }
        })
        .await
    }

    async fn watch_key(
        &self,
        folder: &str,
        key: &str,
        _zone: &str,
        cursor: VersionCursor,
        cancel: &CancellationToken,
    ) -> WatchResult<Option<Vec<u8>>> {
        let full_key = format!("{}/{}", folder, key);
        let resource = format!("kv/{}", full_key);
        if self.state.lock().key_outage {
            let context = RequestContext::new(&full_key, format!("{}/{}", STORE_ADDRESS, resource), STORE_ADDRESS);
            return WatchResult::failed(
                DiscoveryError::transient(context.clone(), "kv read refused"),
                context,
            );
        }
        self.blocking_query(&full_key, &resource, cursor, cancel, |state| {
            match state.keys.get(&full_key) {
                Some(value) => WatchOutcome::Data(value.clone()),
                None => WatchOutcome::Undeployed,
            }
        })
        .await
    }

    async fn list_keys(
        &self,
        folder: &str,
        _zone: &str,
        cursor: VersionCursor,
        cancel: &CancellationToken,
    ) -> WatchResult<Vec<String>> {
        let prefix = format!("{}/", folder);
        let resource = format!("list/{}", folder);
        self.blocking_query(folder, &resource, cursor, cancel, |state| {
            let mut names: Vec<String> = state
                .keys
                .keys()
                .filter_map(|key| key.strip_prefix(&prefix))
                .map(str::to_string)
                .collect();
            names.sort();
            if names.is_empty() {
                WatchOutcome::Undeployed
            } else {
                WatchOutcome::Data(names)
            }
        })
        .await
    }

    fn address(&self) -> &str {
        STORE_ADDRESS
    }
}

/// 测试用配置：短重试间隔，长空闲生命周期
pub fn test_config() -> SharedConfig {
    DiscoveryConfig {
        consul_address: STORE_ADDRESS.to_string(),
        request_timeout_ms: 1_000,
        long_poll_margin_ms: 0,
        transport_timeout_ms: 2_000,
        error_retry_interval_ms: 50,
        ..Default::default()
    }
    .into_shared()
}

pub fn node(host: &str, port: u16) -> Node {
    Node::new(host, Some(port))
}

pub fn versioned(host: &str, port: u16, version: &str) -> Node {
    Node::new(host, Some(port)).with_version(version)
}

/// 轮询条件直到成立或超时
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
