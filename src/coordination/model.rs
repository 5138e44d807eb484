//! Consul HTTP 响应模型

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;

use crate::discovery::instance::Node;

/// `/v1/health/service/{name}` 的单个条目
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthEntry {
    pub node: HealthNode,
    pub service: HealthService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthNode {
    #[serde(rename = "Node")]
    pub name: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthService {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl HealthEntry {
    /// 转换为节点：主机名取 Consul 节点名，节点名为空时回退到服务地址
    pub fn into_node(self) -> Node {
        let hostname = if self.node.name.is_empty() {
            self.service.address
        } else {
            self.node.name
        };
        let port = (self.service.port != 0).then_some(self.service.port);
        let version = self
            .service
            .tags
            .unwrap_or_default()
            .iter()
            .find_map(|tag| parse_version_tag(tag));

        Node {
            hostname,
            port,
            version,
        }
    }
}

/// 解析 `version=<v>` 或 `version:<v>` 形式的标签
fn parse_version_tag(tag: &str) -> Option<String> {
    let (key, value) = tag.split_once('=').or_else(|| tag.split_once(':'))?;
    (key.trim().eq_ignore_ascii_case("version") && !value.trim().is_empty())
        .then(|| value.trim().to_string())
}

/// `/v1/kv/...` 的单个条目
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KvEntry {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

impl KvEntry {
    /// base64 解码值
    pub fn decode_value(&self) -> Result<Option<Vec<u8>>, String> {
        match &self.value {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(Some)
                .map_err(|e| format!("invalid base64 value for key {}: {}", self.key, e)),
            None => Ok(None),
        }
    }
}

/// 服务激活版本记录，存放于 `service/{name}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VersionRecord {
    #[serde(default, alias = "Version")]
    pub version: Option<String>,
}

impl VersionRecord {
    /// 激活版本（空字符串视为没有版本）
    pub fn active_version(&self) -> Option<&str> {
        self.version.as_deref().filter(|v| !v.trim().is_empty())
    }
}
