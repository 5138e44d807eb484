//! Flare Discovery Library
//!
//! Client-side service discovery and load balancing over Consul long polls:
//! deployment node monitoring with version filtering, a deployed-service list,
//! an idle-evicting discovery cache and reachability-aware load balancing.

pub mod config;
pub mod coordination;
pub mod discovery;
pub mod error;
pub mod health;
pub mod metrics;
pub mod retry;
pub mod telemetry;
pub mod utils;

// Re-exports
pub use config::{Config, LoggingConfig};
pub use coordination::{ConsulClient, CoordinationClient, VersionCursor, WatchOutcome, WatchResult};
pub use error::{DiscoveryError, ErrorCategory, ErrorCode, RequestContext, Result, UnreachableNode};

// 服务发现 re-exports
pub use discovery::{
    DeploymentIdentifier, DiscoveryCache, DiscoveryConfig, LoadBalancer, Node, NodeMonitor,
    NodeReachabilityTracker, NodeSource, NodeSourceFactory, NodeSourceKind, ReachabilityCheck,
    ServiceDiscovery, ServiceListMonitor, SharedConfig, TcpReachabilityCheck,
    TrafficRoutingStrategy,
};

pub use health::*;
pub use metrics::*;
pub use retry::*;
pub use telemetry::{TracingFormat, init_tracing};
pub use utils::*;
