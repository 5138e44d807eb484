//! 负载均衡与可达性跟踪测试

mod common;

use async_trait::async_trait;
use common::{FakeStore, eventually, node, test_config};
use flare_discovery::coordination::CoordinationClient;
use flare_discovery::{
    DeploymentIdentifier, DiscoveryError, ExponentialBackoffPolicy, HealthRegistry, HealthStatus,
    LoadBalancer, MetricsCollector, Node, ReachabilityCheck, RetryPolicy, ServiceDiscovery,
    TrafficRoutingStrategy, with_request_id,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(3);

fn orders() -> DeploymentIdentifier {
    DeploymentIdentifier::new("orders", "prod", "")
}

/// 可控的可达性检查：`down` 中的主机检查失败
#[derive(Default)]
struct ScriptedCheck {
    down: Mutex<HashSet<String>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedCheck {
    fn set_down(&self, host: &str, down: bool) {
        let mut hosts = self.down.lock();
        if down {
            hosts.insert(host.to_string());
        } else {
            hosts.remove(host);
        }
    }

    fn calls(&self, host: &str) -> usize {
        self.calls.lock().get(host).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ReachabilityCheck for ScriptedCheck {
    async fn check(&self, node: &Node) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        *self.calls.lock().entry(node.hostname.clone()).or_default() += 1;
        if self.down.lock().contains(&node.hostname) {
            return Err(format!("connection to {} refused", node.hostname).into());
        }
        Ok(())
    }
}

struct Fixture {
    store: Arc<FakeStore>,
    discovery: ServiceDiscovery,
    health: HealthRegistry,
    metrics: MetricsCollector,
    check: Arc<ScriptedCheck>,
}

impl Fixture {
    fn new(nodes: Vec<Node>) -> Self {
        let store = FakeStore::new();
        if !nodes.is_empty() {
            store.deploy("orders-prod", nodes);
        }
        let health = HealthRegistry::new();
        let metrics = MetricsCollector::new();
        let client: Arc<dyn CoordinationClient> = store.clone();
        let discovery =
            ServiceDiscovery::with_client(test_config(), client, Arc::new(health.clone()), metrics.clone());
        Self {
            store,
            discovery,
            health,
            metrics,
            check: Arc::new(ScriptedCheck::default()),
        }
    }

    fn balancer(&self, strategy: TrafficRoutingStrategy) -> LoadBalancer {
        self.discovery
            .create_load_balancer(orders(), self.check.clone(), strategy)
    }
}

async fn pick(balancer: &LoadBalancer) -> Node {
    balancer
        .get_node()
        .await
        .expect("node selection")
        .expect("deployed")
}

/// 测试：轮询覆盖所有节点且分布均匀
#[tokio::test]
async fn test_round_robin_covers_all_nodes() {
    let fixture = Fixture::new(vec![node("a", 80), node("b", 80), node("c", 80)]);
    let balancer = fixture.balancer(TrafficRoutingStrategy::RoundRobin);

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..9 {
        *counts.entry(pick(&balancer).await.hostname).or_default() += 1;
    }

    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|count| *count == 3));
    assert_eq!(fixture.health.get_status("balancer:orders-prod"), HealthStatus::Healthy);
    fixture.discovery.shutdown();
}

/// 测试：只有一个节点时总是返回该节点
#[tokio::test]
async fn test_single_node_is_always_selected() {
    let fixture = Fixture::new(vec![node("a", 80)]);
    let balancer = fixture.balancer(TrafficRoutingStrategy::RoundRobin);

    for _ in 0..5 {
        assert_eq!(pick(&balancer).await, node("a", 80));
    }
    fixture.discovery.shutdown();
}

/// 测试：未部署时返回 None
#[tokio::test]
async fn test_not_deployed_returns_none() {
    let fixture = Fixture::new(Vec::new());
    let balancer = fixture.balancer(TrafficRoutingStrategy::RoundRobin);

    assert!(balancer.get_node().await.expect("not an error").is_none());
    fixture.discovery.shutdown();
}

/// 测试：从未发现节点时返回包装原因的发现错误
#[tokio::test]
async fn test_never_discovered_is_discovery_error() {
    let fixture = Fixture::new(Vec::new());
    fixture.store.set_outage(true);
    let balancer = fixture.balancer(TrafficRoutingStrategy::RoundRobin);

    let err = balancer.get_node().await.expect_err("store unavailable");
    assert!(matches!(err, DiscoveryError::Discovery { .. }));
    fixture.discovery.shutdown();
}

/// 测试：报告不可达的节点被排除，重复报告不会启动新的检查，恢复后重新加入
#[tokio::test]
async fn test_unreachable_node_is_excluded_until_recovered() {
    let fixture = Fixture::new(vec![node("a", 80), node("b", 80), node("c", 80)]);
    let balancer = fixture.balancer(TrafficRoutingStrategy::RoundRobin);
    pick(&balancer).await;

    fixture.check.set_down("b", true);
    balancer.report_unreachable(&node("b", 80), Some("connection reset".to_string()));
    balancer.report_unreachable(&node("b", 80), Some("connection reset".to_string()));

    for _ in 0..12 {
        assert_ne!(pick(&balancer).await.hostname, "b");
    }
    assert_eq!(fixture.metrics.get_metrics().reachability_episodes, 1);
    assert!(eventually(WAIT, || fixture.check.calls("b") >= 2).await);

    fixture.check.set_down("b", false);
    assert!(eventually(WAIT, || balancer.reachable_nodes().len() == 3).await);

    let mut seen = HashSet::new();
    for _ in 0..3 {
        seen.insert(pick(&balancer).await.hostname);
    }
    assert!(seen.contains("b"));
    fixture.discovery.shutdown();
}

/// 测试：所有节点不可达时错误列出每个节点及其最近错误
#[tokio::test]
async fn test_all_unreachable_lists_every_node() {
    let fixture = Fixture::new(vec![node("a", 80), node("b", 81), node("c", 82)]);
    let balancer = fixture.balancer(TrafficRoutingStrategy::RoundRobin);
    pick(&balancer).await;

    for (host, port) in [("a", 80), ("b", 81), ("c", 82)] {
        fixture.check.set_down(host, true);
        balancer.report_unreachable(&node(host, port), Some(format!("{} timed out", host)));
    }

    let err = balancer.get_node().await.expect_err("no reachable node");
    match &err {
        DiscoveryError::AllNodesUnreachable { nodes, .. } => {
            let endpoints: Vec<&str> = nodes.iter().map(|n| n.endpoint.as_str()).collect();
            assert_eq!(endpoints, vec!["a:80", "b:81", "c:82"]);
            assert!(nodes.iter().all(|n| n.last_error.is_some()));
        }
        other => panic!("expected AllNodesUnreachable, got {:?}", other),
    }
    let message = err.to_string();
    assert!(message.contains("a:80") && message.contains("b:81") && message.contains("c:82"));
    assert_eq!(fixture.health.get_status("balancer:orders-prod"), HealthStatus::Unhealthy);
    fixture.discovery.shutdown();
}

/// 测试：节点从部署中移除后停止对其的检查
#[tokio::test]
async fn test_removed_node_stops_checks() {
    let fixture = Fixture::new(vec![node("a", 80), node("b", 80)]);
    let balancer = fixture.balancer(TrafficRoutingStrategy::RoundRobin);
    pick(&balancer).await;

    fixture.check.set_down("b", true);
    balancer.report_unreachable(&node("b", 80), None);
    assert!(eventually(WAIT, || fixture.check.calls("b") >= 1).await);

    fixture.store.set_nodes("orders-prod", vec![node("a", 80)]);
    let mut reconciled = false;
    for _ in 0..300 {
        pick(&balancer).await;
        if balancer.tracked_nodes() == vec![node("a", 80)] {
            reconciled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(reconciled);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let calls = fixture.check.calls("b");
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(fixture.check.calls("b"), calls);
    fixture.discovery.shutdown();
}

/// 测试：按请求 ID 固定节点，没有请求 ID 时退化为轮询
#[tokio::test]
async fn test_stable_by_request_id() {
    let fixture = Fixture::new(vec![node("a", 80), node("b", 80), node("c", 80)]);
    let balancer = fixture.balancer(TrafficRoutingStrategy::StableByRequestId);

    let pinned = with_request_id("req-42", async {
        let first = pick(&balancer).await;
        for _ in 0..5 {
            assert_eq!(pick(&balancer).await, first);
        }
        first
    })
    .await;
    assert!(["a", "b", "c"].contains(&pinned.hostname.as_str()));

    let mut seen = HashSet::new();
    for _ in 0..3 {
        seen.insert(pick(&balancer).await.hostname);
    }
    assert_eq!(seen.len(), 3);
    fixture.discovery.shutdown();
}

/// 测试：释放后拒绝选择
#[tokio::test]
async fn test_disposed_balancer_rejects_selection() {
    let fixture = Fixture::new(vec![node("a", 80)]);
    let balancer = fixture.balancer(TrafficRoutingStrategy::RoundRobin);
    pick(&balancer).await;

    balancer.dispose();

    assert!(matches!(balancer.get_node().await, Err(DiscoveryError::Disposed(_))));
    assert!(fixture.health.get_record("balancer:orders-prod").is_none());
    fixture.discovery.shutdown();
}

/// 测试：可达性检查的退避是 attempt 的纯函数：1ms 起步，翻倍，2s 封顶
#[test]
fn test_reachability_backoff_schedule() {
    let policy = ExponentialBackoffPolicy::reachability();

    assert_eq!(policy.backoff_duration(0), Duration::from_millis(1));
    assert_eq!(policy.backoff_duration(1), Duration::from_millis(2));
    assert_eq!(policy.backoff_duration(10), Duration::from_millis(1024));
    assert_eq!(policy.backoff_duration(11), Duration::from_secs(2));
    assert_eq!(policy.backoff_duration(64), Duration::from_secs(2));
    assert_eq!(policy.backoff_duration(3), policy.backoff_duration(3));
}
