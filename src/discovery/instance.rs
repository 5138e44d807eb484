//! 部署标识与节点定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 部署标识：(服务名, 环境, 可用区)
///
/// 值语义，用作所有缓存 / map 的键。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentIdentifier {
    /// 服务名（如 "message-orchestrator"）
    pub service_name: String,

    /// 环境（如 "prod", "staging"），为空表示不区分环境
    pub environment: String,

    /// 可用区 / 数据中心（对应 Consul 的 `dc` 参数）
    pub zone: String,
}

impl DeploymentIdentifier {
    /// 创建新的部署标识
    pub fn new(
        service_name: impl Into<String>,
        environment: impl Into<String>,
        zone: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            environment: environment.into(),
            zone: zone.into(),
        }
    }

    /// Consul 中的服务名：`{service}-{environment}`
    pub fn consul_service_name(&self) -> String {
        if self.environment.is_empty() {
            self.service_name.clone()
        } else {
            format!("{}-{}", self.service_name, self.environment)
        }
    }
}

impl fmt::Display for DeploymentIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.zone.is_empty() {
            f.write_str(&self.consul_service_name())
        } else {
            write!(f, "{}@{}", self.consul_service_name(), self.zone)
        }
    }
}

/// 服务节点
///
/// 不可变；每次收敛都会整体生成新的节点列表，调用方拿到的列表是只读快照。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    /// 主机名
    pub hostname: String,

    /// 端口
    pub port: Option<u16>,

    /// 版本标签
    pub version: Option<String>,
}

impl Node {
    /// 创建新的节点
    pub fn new(hostname: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            version: None,
        }
    }

    /// 设置版本
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// 解析 `host[:port]`
    pub fn parse(endpoint: &str) -> Option<Self> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return None;
        }
        match endpoint.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse::<u16>().ok()?;
                Some(Self::new(host, Some(port)))
            }
            Some(_) => None,
            None => Some(Self::new(endpoint, None)),
        }
    }

    /// `host:port`（没有端口时只返回主机名）
    pub fn endpoint(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.hostname, port),
            None => self.hostname.clone(),
        }
    }

    /// 检查是否匹配版本
    pub fn matches_version(&self, version: Option<&str>) -> bool {
        match (version, &self.version) {
            (None, _) => true,
            (Some(v), Some(node_v)) => v == node_v,
            (Some(_), None) => false,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.endpoint())?;
        if let Some(version) = &self.version {
            write!(f, " ({})", version)?;
        }
        Ok(())
    }
}
