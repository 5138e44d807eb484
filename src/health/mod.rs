//! 健康状态模块
//!
//! 每个被监听的部署都会发布一条 "布尔值 + 描述" 的健康记录；外部聚合器只作为接收端。

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::RwLock;

/// 健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

/// 健康记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

impl HealthRecord {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: message.into(),
            updated_at: Utc::now(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: message.into(),
            updated_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// 健康记录接收端
pub trait HealthSink: Send + Sync {
    /// 发布（覆盖）组件的健康记录
    fn publish(&self, component: &str, record: HealthRecord);

    /// 组件被释放后移除其记录
    fn remove(&self, component: &str);
}

/// 内存中的健康记录表
#[derive(Clone, Default)]
pub struct HealthRegistry {
    records: Arc<RwLock<HashMap<String, HealthRecord>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_status(&self, component: &str) -> HealthStatus {
        self.records
            .read()
            .get(component)
            .map(|record| record.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    pub fn get_record(&self, component: &str) -> Option<HealthRecord> {
        self.records.read().get(component).cloned()
    }

    /// 所有组件的记录快照
    pub fn snapshot(&self) -> HashMap<String, HealthRecord> {
        self.records.read().clone()
    }

    /// 所有组件都健康时返回 true
    pub fn is_all_healthy(&self) -> bool {
        self.records.read().values().all(HealthRecord::is_healthy)
    }
}

impl HealthSink for HealthRegistry {
    fn publish(&self, component: &str, record: HealthRecord) {
        self.records.write().insert(component.to_string(), record);
    }

    fn remove(&self, component: &str) {
        self.records.write().remove(component);
    }
}
