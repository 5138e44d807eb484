//! 服务发现与负载均衡模块
//!
//! 通过 Consul 长轮询维护每个部署的节点列表，支持版本过滤、已部署服务列表、
//! 空闲淘汰的发现缓存，以及带可达性跟踪的客户端负载均衡。

pub mod cache;
pub mod config;
pub mod factory;
pub mod instance;
pub mod load_balancer;
pub mod node_monitor;
pub mod reachability;
pub mod service;
pub mod service_list;
pub mod source;

pub use cache::DiscoveryCache;
pub use config::{
    DiscoveryConfig, NodeSourceKind, ServiceDiscoveryConfig, SharedConfig, TrafficRoutingStrategy,
};
pub use factory::{
    ConsulNodeSourceFactory, DeploymentStatus, NodeSourceFactory, StaticNodeSourceFactory,
};
pub use instance::{DeploymentIdentifier, Node};
pub use load_balancer::LoadBalancer;
pub use node_monitor::{NodeMonitor, NodeSnapshot};
pub use reachability::{
    NodeReachabilityTracker, ReachabilityCheck, ReachabilityStatus, ReachableCallback,
    TcpReachabilityCheck,
};
pub use service::ServiceDiscovery;
pub use service_list::{ServiceListMonitor, ServiceListSnapshot};
pub use source::{ConsulNodeSource, NodeSource, StaticNodeSource};
