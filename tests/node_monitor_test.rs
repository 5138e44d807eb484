//! 节点监听器与服务列表监听器测试（内存协调存储）

mod common;

use common::{FakeStore, eventually, node, test_config, versioned};
use flare_discovery::coordination::CoordinationClient;
use flare_discovery::discovery::{NodeMonitor, ServiceListMonitor};
use flare_discovery::{DeploymentIdentifier, DiscoveryError, HealthRegistry, HealthSink, HealthStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(3);

fn orders() -> DeploymentIdentifier {
    DeploymentIdentifier::new("orders", "prod", "")
}

fn start_monitor(store: &Arc<FakeStore>, health: &HealthRegistry, cancel: &CancellationToken) -> NodeMonitor {
    let client: Arc<dyn CoordinationClient> = store.clone();
    let sink: Arc<dyn HealthSink> = Arc::new(health.clone());
    NodeMonitor::start(orders(), "orders-prod", client, test_config(), sink, cancel)
}

/// 测试：初始化后得到节点列表，并随存储变化收敛
#[tokio::test]
async fn test_monitor_converges_on_changes() {
    let store = FakeStore::new();
    store.deploy("orders-prod", vec![node("a", 80), node("b", 80)]);
    let health = HealthRegistry::new();
    let cancel = CancellationToken::new();

    let monitor = start_monitor(&store, &health, &cancel);
    monitor.init().await;

    assert_eq!(monitor.nodes().expect("nodes").len(), 2);
    assert_eq!(health.get_status("discovery:orders-prod"), HealthStatus::Healthy);

    store.set_nodes("orders-prod", vec![node("a", 80), node("b", 80), node("c", 80)]);
    assert!(eventually(WAIT, || monitor.nodes().map(|n| n.len()).unwrap_or(0) == 3).await);

    store.set_nodes("orders-prod", vec![node("c", 80)]);
    assert!(eventually(WAIT, || monitor.nodes().map(|n| n.len()).unwrap_or(0) == 1).await);
    assert_eq!(*monitor.nodes().expect("nodes"), vec![node("c", 80)]);

    monitor.dispose();
}

/// 测试：节点未变化时读取方看到同一个列表实例
#[tokio::test]
async fn test_unchanged_nodes_keep_identity() {
    let store = FakeStore::new();
    store.deploy("orders-prod", vec![node("a", 80)]);
    let health = HealthRegistry::new();
    let cancel = CancellationToken::new();

    let monitor = start_monitor(&store, &health, &cancel);
    monitor.init().await;
    let first = monitor.nodes().expect("nodes");

    // 内容相同的写入会推进索引，但列表内容不变
    store.set_nodes("orders-prod", vec![node("a", 80)]);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let second = monitor.nodes().expect("nodes");
    assert!(Arc::ptr_eq(&first, &second));
    cancel.cancel();
}

/// 测试：存储故障期间保留最后一次成功的节点，并通过健康记录暴露
#[tokio::test]
async fn test_outage_keeps_last_known_nodes() {
    let store = FakeStore::new();
    store.deploy("orders-prod", vec![node("a", 80), node("b", 80)]);
    let health = HealthRegistry::new();
    let cancel = CancellationToken::new();

    let monitor = start_monitor(&store, &health, &cancel);
    monitor.init().await;

    store.set_outage(true);
    assert!(
        eventually(WAIT, || {
            health.get_status("discovery:orders-prod") == HealthStatus::Unhealthy
        })
        .await
    );
    assert_eq!(monitor.nodes().expect("last known nodes").len(), 2);
    assert!(monitor.snapshot().last_error_at.is_some());

    store.set_outage(false);
    assert!(
        eventually(WAIT, || {
            health.get_status("discovery:orders-prod") == HealthStatus::Healthy
        })
        .await
    );
    cancel.cancel();
}

/// 测试：只返回携带激活版本的节点
#[tokio::test]
async fn test_active_version_filters_nodes() {
    let store = FakeStore::new();
    store.deploy(
        "orders-prod",
        vec![versioned("a", 80, "1.0"), versioned("b", 80, "2.0"), versioned("c", 80, "2.0")],
    );
    store.set_version("orders-prod", Some("2.0"));
    let health = HealthRegistry::new();
    let cancel = CancellationToken::new();

    let monitor = start_monitor(&store, &health, &cancel);
    monitor.init().await;

    assert!(
        eventually(WAIT, || {
            monitor
                .nodes()
                .map(|nodes| nodes.iter().all(|n| n.version.as_deref() == Some("2.0")) && nodes.len() == 2)
                .unwrap_or(false)
        })
        .await
    );

    store.set_version("orders-prod", Some("1.0"));
    assert!(
        eventually(WAIT, || {
            monitor.nodes().map(|nodes| *nodes == vec![versioned("a", 80, "1.0")]).unwrap_or(false)
        })
        .await
    );
    cancel.cancel();
}

/// 测试：没有节点携带激活版本时返回明确的错误
#[tokio::test]
async fn test_no_matching_version_is_error() {
    let store = FakeStore::new();
    store.deploy("orders-prod", vec![versioned("a", 80, "1.0"), versioned("b", 80, "1.1")]);
    store.set_version("orders-prod", Some("3.0"));
    let health = HealthRegistry::new();
    let cancel = CancellationToken::new();

    let monitor = start_monitor(&store, &health, &cancel);
    monitor.init().await;

    let err = monitor.nodes().expect_err("no node serves 3.0");
    match &err {
        DiscoveryError::NoMatchingVersion {
            active_version,
            total_nodes,
            available_versions,
            ..
        } => {
            assert_eq!(active_version, "3.0");
            assert_eq!(*total_nodes, 2);
            assert_eq!(available_versions, &vec!["1.0".to_string(), "1.1".to_string()]);
        }
        other => panic!("expected NoMatchingVersion, got {:?}", other),
    }
    assert!(err.to_string().contains("3.0"));
    assert_eq!(health.get_status("discovery:orders-prod"), HealthStatus::Unhealthy);
    cancel.cancel();
}

/// 测试：部署被移除后监听器报告未部署
#[tokio::test]
async fn test_undeploy_is_detected() {
    let store = FakeStore::new();
    store.deploy("orders-prod", vec![node("a", 80)]);
    let health = HealthRegistry::new();
    let cancel = CancellationToken::new();

    let monitor = start_monitor(&store, &health, &cancel);
    monitor.init().await;
    assert!(!monitor.is_undeployed());

    store.undeploy("orders-prod");
    assert!(eventually(WAIT, || monitor.is_undeployed()).await);
    assert!(monitor.nodes().expect("undeployed is not an error").is_empty());
    cancel.cancel();
}

/// 测试：释放后停止长轮询并移除健康记录
#[tokio::test]
async fn test_dispose_stops_polling() {
    let store = FakeStore::new();
    store.deploy("orders-prod", vec![node("a", 80)]);
    let health = HealthRegistry::new();
    let cancel = CancellationToken::new();

    let monitor = start_monitor(&store, &health, &cancel);
    monitor.init().await;
    monitor.dispose();
    assert!(monitor.is_disposed());
    assert!(health.get_record("discovery:orders-prod").is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let calls = store.health_calls("orders-prod");
    store.set_nodes("orders-prod", vec![node("b", 80)]);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.health_calls("orders-prod"), calls);
}

/// 测试：服务列表跟踪部署 / 移除，并按大小写不敏感唯一匹配解析服务名
#[tokio::test]
async fn test_service_list_tracks_deployments() {
    let store = FakeStore::new();
    store.deploy("Orders-prod", vec![node("a", 80)]);
    let health = HealthRegistry::new();
    let cancel = CancellationToken::new();
    let client: Arc<dyn CoordinationClient> = store.clone();

    let list = ServiceListMonitor::start("", client, test_config(), Arc::new(health.clone()), &cancel);
    list.init().await;

    assert!(list.is_converged());
    assert_eq!(list.resolve_service_name("orders-prod").as_deref(), Some("Orders-prod"));
    assert!(!list.is_service_deployed("billing-prod"));
    let changes = list.change_count();

    store.deploy("billing-prod", vec![node("b", 80)]);
    assert!(eventually(WAIT, || list.is_service_deployed("billing-prod")).await);
    assert!(list.change_count() > changes);

    store.undeploy("billing-prod");
    assert!(eventually(WAIT, || !list.is_service_deployed("billing-prod")).await);
    cancel.cancel();
}

/// 测试：仅大小写不同的服务名被标记为不健康，且不做模糊匹配
#[tokio::test]
async fn test_service_list_flags_case_collisions() {
    let store = FakeStore::new();
    store.deploy("Orders-prod", vec![node("a", 80)]);
    store.deploy("ORDERS-prod", vec![node("b", 80)]);
    let health = HealthRegistry::new();
    let cancel = CancellationToken::new();
    let client: Arc<dyn CoordinationClient> = store.clone();

    let list = ServiceListMonitor::start("", client, test_config(), Arc::new(health.clone()), &cancel);
    list.init().await;

    assert_eq!(
        list.snapshot().case_collisions,
        vec![vec!["ORDERS-prod".to_string(), "Orders-prod".to_string()]]
    );
    assert_eq!(health.get_status("discovery:service-list"), HealthStatus::Unhealthy);
    assert_eq!(list.resolve_service_name("orders-prod"), None);
    assert_eq!(list.resolve_service_name("Orders-prod").as_deref(), Some("Orders-prod"));
    cancel.cancel();
}

/// 测试：存储故障期间按错误重试间隔重新请求，不会连续打满存储
#[tokio::test]
async fn test_failing_watch_retries_at_error_interval() {
    let store = FakeStore::new();
    store.deploy("orders-prod", vec![node("a", 80)]);
    let health = HealthRegistry::new();
    let cancel = CancellationToken::new();

    let monitor = start_monitor(&store, &health, &cancel);
    monitor.init().await;

    store.set_outage(true);
    let before = store.health_calls("orders-prod");
    tokio::time::sleep(Duration::from_millis(500)).await;
    let calls = store.health_calls("orders-prod") - before;

    // 重试间隔 50ms：500ms 内约 10 次
    assert!(calls >= 3, "expected retries during outage, got {}", calls);
    assert!(calls <= 20, "retries not paced by the error interval: {}", calls);
    cancel.cancel();
}

/// 测试：未部署的目标保持稳定的轮询节奏
#[tokio::test]
async fn test_undeployed_target_polls_at_steady_cadence() {
    let store = FakeStore::new();
    let health = HealthRegistry::new();
    let cancel = CancellationToken::new();

    let monitor = start_monitor(&store, &health, &cancel);
    monitor.init().await;
    assert!(monitor.is_undeployed());

    let before = store.health_calls("orders-prod");
    tokio::time::sleep(Duration::from_millis(500)).await;
    let calls = store.health_calls("orders-prod") - before;

    assert!(calls <= 10, "undeployed target polled {} times in 500ms", calls);
    cancel.cancel();
}

/// 测试：激活版本从未读取成功时不返回未过滤的节点，恢复后按版本过滤
#[tokio::test]
async fn test_unknown_version_withholds_nodes() {
    let store = FakeStore::new();
    store.deploy("orders-prod", vec![versioned("a", 80, "1.0"), versioned("b", 80, "2.0")]);
    store.set_version("orders-prod", Some("1.0"));
    store.set_key_outage(true);
    let health = HealthRegistry::new();
    let cancel = CancellationToken::new();

    let monitor = start_monitor(&store, &health, &cancel);
    monitor.init().await;

    let err = monitor.nodes().expect_err("active version unknown");
    assert!(matches!(err, DiscoveryError::Transient { .. }));
    assert_eq!(monitor.snapshot().total_nodes, 2);
    assert_eq!(health.get_status("discovery:orders-prod"), HealthStatus::Unhealthy);

    store.set_key_outage(false);
    assert!(
        eventually(WAIT, || {
            monitor.nodes().map(|nodes| *nodes == vec![versioned("a", 80, "1.0")]).unwrap_or(false)
        })
        .await
    );
    cancel.cancel();
}
