//! Consul 长轮询客户端
//!
//! 每次调用发出一个阻塞查询：`index=<cursor>&wait=<n>s`，并从 `X-Consul-Index`
//! 响应头读取新的游标。传输层超时独立配置且总是大于长轮询等待时间，
//! 因此 "传输挂起" 与 "合法的空长轮询" 可以区分。

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode, Url};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::coordination::model::{HealthEntry, KvEntry};
use crate::coordination::{CoordinationClient, VersionCursor, WatchOutcome, WatchResult};
use crate::discovery::config::SharedConfig;
use crate::discovery::instance::Node;
use crate::error::{DiscoveryError, RequestContext, Result};
use crate::metrics::MetricsCollector;

/// 游标响应头
pub const INDEX_HEADER: &str = "x-consul-index";

/// Consul 长轮询客户端
pub struct ConsulClient {
    http_client: HttpClient,
    consul_url: String,
    config: SharedConfig,
    metrics: MetricsCollector,
}

impl ConsulClient {
    /// 创建新的 Consul 客户端
    ///
    /// 传输层超时在创建时读取；修改该项需要重建客户端。
    pub fn new(config: SharedConfig, metrics: MetricsCollector) -> Result<Self> {
        let snapshot = config.load();
        snapshot.validate()?;

        let http_client = HttpClient::builder()
            .timeout(snapshot.transport_timeout())
            .build()
            .map_err(|e| DiscoveryError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            consul_url: snapshot.consul_address.trim_end_matches('/').to_string(),
            config,
            metrics,
        })
    }

    fn build_url(
        &self,
        segments: &[&str],
        zone: &str,
        flags: &[&str],
        cursor: VersionCursor,
    ) -> Result<Url> {
        let wait = self.config.load().long_poll_wait();
        let mut url = Url::parse(&self.consul_url)
            .map_err(|e| DiscoveryError::config(format!("invalid consul address: {}", e)))?;

        url.path_segments_mut()
            .map_err(|_| DiscoveryError::config("consul address cannot be a base URL"))?
            .pop_if_empty()
            .extend(segments);

        {
            let mut query = url.query_pairs_mut();
            if !zone.is_empty() {
                query.append_pair("dc", zone);
            }
            for flag in flags {
                query.append_key_only(flag);
            }
            query.append_pair("index", &cursor.to_string());
            query.append_pair("wait", &format!("{}s", wait.as_secs()));
        }

        Ok(url)
    }

    /// 发出一次阻塞查询，返回原始响应体
    async fn long_poll(
        &self,
        target: &str,
        segments: &[&str],
        zone: &str,
        flags: &[&str],
        cursor: VersionCursor,
        cancel: &CancellationToken,
    ) -> WatchResult<String> {
        let url = match self.build_url(segments, zone, flags, cursor) {
            Ok(url) => url,
            Err(e) => {
                return WatchResult::failed(e, RequestContext::new(target, "", &self.consul_url));
            }
        };
        let context = RequestContext::new(target, url.as_str(), &self.consul_url);

        let request = async {
            let response = self.http_client.get(url.clone()).send().await?;
            let status = response.status();
            let returned = response
                .headers()
                .get(INDEX_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(VersionCursor)
                .unwrap_or(VersionCursor::ZERO);
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, returned, body))
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                return WatchResult::failed(
                    DiscoveryError::Disposed(format!("watch on {}", target)),
                    context,
                );
            }
            result = request => result,
        };

        let (status, returned, body) = match result {
            Ok(parts) => parts,
            Err(e) => {
                let reason = if e.is_timeout() {
                    format!(
                        "request timed out after {}ms",
                        self.config.load().transport_timeout_ms
                    )
                } else {
                    e.to_string()
                };
                warn!(
                    target = %target,
                    request = %url,
                    error = %reason,
                    "Coordination store request failed"
                );
                self.metrics.record_watch(true, false);
                return WatchResult::failed(DiscoveryError::transient(context.clone(), reason), context);
            }
        };

        let context = context.with_response(status.as_u16(), &body);
        let outcome = if status == StatusCode::OK {
            WatchOutcome::Data(body.clone())
        } else if status == StatusCode::NOT_FOUND
            || body.to_lowercase().contains("query not found")
        {
            WatchOutcome::Undeployed
        } else {
            warn!(
                target = %target,
                request = %url,
                status = status.as_u16(),
                raw_response = %body,
                "Coordination store returned unexpected status"
            );
            WatchOutcome::Failed(DiscoveryError::unexpected_response(
                context.clone(),
                status.as_u16(),
            ))
        };

        self.metrics.record_watch(
            matches!(outcome, WatchOutcome::Failed(_)),
            matches!(outcome, WatchOutcome::Undeployed),
        );
        debug!(
            target = %target,
            status = status.as_u16(),
            cursor = %returned,
            "Coordination store responded"
        );

        WatchResult {
            outcome,
            cursor: returned,
            context,
            raw_response: body,
        }
    }
}

#[async_trait]
impl CoordinationClient for ConsulClient {
    async fn watch_health(
        &self,
        service: &str,
        zone: &str,
        cursor: VersionCursor,
        cancel: &CancellationToken,
    ) -> WatchResult<Vec<Node>> {
        self.long_poll(
            service,
            &["v1", "health", "service", service],
            zone,
            &["passing"],
            cursor,
            cancel,
        )
        .await
        .try_map(|body| {
            serde_json::from_str::<Vec<HealthEntry>>(&body)
                .map(|entries| entries.into_iter().map(HealthEntry::into_node).collect())
                .map_err(|e| format!("invalid health response: {}", e))
        })
    }

    async fn watch_key(
        &self,
        folder: &str,
        key: &str,
        zone: &str,
        cursor: VersionCursor,
        cancel: &CancellationToken,
    ) -> WatchResult<Option<Vec<u8>>> {
        let full_key = format!("{}/{}", folder, key);
        self.long_poll(&full_key, &["v1", "kv", folder, key], zone, &[], cursor, cancel)
            .await
            .try_map(|body| {
                let entries = serde_json::from_str::<Vec<KvEntry>>(&body)
                    .map_err(|e| format!("invalid key/value response: {}", e))?;
                match entries.into_iter().find(|entry| entry.key == full_key) {
                    Some(entry) => entry.decode_value(),
                    None => Ok(None),
                }
            })
    }

    async fn list_keys(
        &self,
        folder: &str,
        zone: &str,
        cursor: VersionCursor,
        cancel: &CancellationToken,
    ) -> WatchResult<Vec<String>> {
        let prefix = format!("{}/", folder);
        self.long_poll(folder, &["v1", "kv", folder], zone, &["keys"], cursor, cancel)
            .await
            .try_map(|body| {
                let keys = serde_json::from_str::<Vec<String>>(&body)
                    .map_err(|e| format!("invalid key listing: {}", e))?;
                let mut names: Vec<String> = Vec::with_capacity(keys.len());
                for key in keys {
                    let Some(rest) = key.strip_prefix(&prefix) else {
                        continue;
                    };
                    let name = rest.split('/').next().unwrap_or_default();
                    if !name.is_empty() && !names.iter().any(|n| n == name) {
                        names.push(name.to_string());
                    }
                }
                Ok(names)
            })
    }

    fn address(&self) -> &str {
        &self.consul_url
    }
}
