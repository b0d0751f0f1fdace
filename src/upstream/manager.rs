//! Upstream MCP server connection management.
//!
//! Each configured upstream moves through Disconnected -> Connecting -> Ready
//! or Failed, independently of its siblings. A Failed upstream never takes the
//! relay down unless it was marked required at startup; stale upstreams get a
//! fresh connection attempt at the start of every catalog refresh.

use std::{borrow::Cow, collections::HashMap, fmt, process::Stdio, sync::Arc, time::Duration};

use backoff::ExponentialBackoffBuilder;
use dashmap::DashMap;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, Tool},
    service::RunningService,
    transport::{
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
        ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    },
    RoleClient, ServiceExt,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::{LimitsConfig, UpstreamConfig, UpstreamTransport},
    error::{RelayError, RelayResult},
    metrics::RelayMetrics,
};

/// Connected upstream client handle.
type UpstreamClient = RunningService<RoleClient, ()>;

/// Externally visible connection state of one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamState {
    Disconnected,
    Connecting,
    Ready,
    Failed,
}

impl fmt::Display for UpstreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UpstreamState::Disconnected => "disconnected",
            UpstreamState::Connecting => "connecting",
            UpstreamState::Ready => "ready",
            UpstreamState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Internal state carrying the live client while Ready.
enum UpstreamStatus {
    Disconnected,
    Connecting,
    Ready(Arc<UpstreamClient>),
    Failed,
}

impl UpstreamStatus {
    fn state(&self) -> UpstreamState {
        match self {
            UpstreamStatus::Disconnected => UpstreamState::Disconnected,
            UpstreamStatus::Connecting => UpstreamState::Connecting,
            UpstreamStatus::Ready(_) => UpstreamState::Ready,
            UpstreamStatus::Failed => UpstreamState::Failed,
        }
    }
}

struct UpstreamEntry {
    config: UpstreamConfig,
    status: UpstreamStatus,
    tool_count: usize,
    last_error: Option<String>,
}

/// Snapshot of one upstream for diagnostics output.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamInfo {
    pub id: String,
    pub protocol: &'static str,
    pub endpoint: String,
    pub state: UpstreamState,
    pub required: bool,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub struct UpstreamManager {
    entries: DashMap<String, UpstreamEntry>,
    /// Configuration order, which fixes catalog and diagnostics ordering.
    order: Vec<String>,
    limits: LimitsConfig,
    metrics: Arc<RelayMetrics>,
}

impl UpstreamManager {
    pub fn new(
        upstreams: Vec<UpstreamConfig>,
        limits: LimitsConfig,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let entries = DashMap::new();
        let mut order = Vec::with_capacity(upstreams.len());
        for config in upstreams {
            order.push(config.id.clone());
            entries.insert(
                config.id.clone(),
                UpstreamEntry {
                    config,
                    status: UpstreamStatus::Disconnected,
                    tool_count: 0,
                    last_error: None,
                },
            );
        }
        Self {
            entries,
            order,
            limits,
            metrics,
        }
    }

    /// Upstream identifiers in configuration order.
    pub fn ids(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn state(&self, id: &str) -> Option<UpstreamState> {
        self.entries.get(id).map(|entry| entry.status.state())
    }

    pub fn ready_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.status, UpstreamStatus::Ready(_)))
            .count()
    }

    /// Connect every configured upstream concurrently.
    ///
    /// A required upstream that cannot be reached is fatal. Optional upstreams
    /// are left in Failed and the relay continues without their tools.
    pub async fn connect_all(&self) -> RelayResult<()> {
        let connects = self.order.iter().map(|id| async move {
            let result = self.connect_inner(id, true).await;
            (id.as_str(), result)
        });

        for (id, result) in futures::future::join_all(connects).await {
            if let Err(e) = result {
                let required = self
                    .entries
                    .get(id)
                    .map(|entry| entry.config.required)
                    .unwrap_or(false);
                if required {
                    error!(upstream = %id, error = %e, "required upstream failed to connect");
                    return Err(RelayError::ConnectionFailed(format!(
                        "required upstream '{}' unavailable: {}",
                        id, e
                    )));
                }
                error!(upstream = %id, error = %e, "optional upstream failed to connect, continuing without it");
            }
        }

        info!(
            ready = self.ready_count(),
            configured = self.order.len(),
            "upstream connections established"
        );
        Ok(())
    }

    /// One fresh connection attempt for every upstream that is not Ready.
    /// Runs at the start of each catalog refresh, without the startup backoff
    /// so a dead upstream cannot stall the round.
    pub async fn reconnect_stale(&self) {
        let stale: Vec<String> = self
            .order
            .iter()
            .filter(|id| {
                matches!(
                    self.state(id.as_str()),
                    Some(UpstreamState::Disconnected | UpstreamState::Failed)
                )
            })
            .cloned()
            .collect();
        if stale.is_empty() {
            return;
        }

        debug!(count = stale.len(), "reconnecting stale upstreams");
        let attempts = stale.iter().map(|id| async move {
            match self.connect_inner(id, false).await {
                Ok(()) => info!(upstream = %id, "upstream reconnected"),
                Err(e) => debug!(upstream = %id, error = %e, "reconnect attempt failed"),
            }
        });
        futures::future::join_all(attempts).await;
    }

    async fn connect_inner(&self, id: &str, retry: bool) -> RelayResult<()> {
        let config = {
            let mut entry = self
                .entries
                .get_mut(id)
                .ok_or_else(|| RelayError::UpstreamNotFound(id.to_string()))?;
            match &entry.status {
                UpstreamStatus::Ready(_) => return Ok(()),
                UpstreamStatus::Connecting => {
                    return Err(RelayError::UpstreamNotReady(format!(
                        "upstream '{}' is already connecting",
                        id
                    )))
                }
                UpstreamStatus::Disconnected | UpstreamStatus::Failed => {}
            }
            entry.status = UpstreamStatus::Connecting;
            entry.config.clone()
        };

        debug!(upstream = %id, transport = config.transport.kind(), "connecting");
        let result = if retry {
            Self::establish_with_retry(&config).await
        } else {
            Self::establish(&config).await
        };

        match result {
            Ok(client) => match self.entries.get_mut(id) {
                Some(mut entry) => {
                    entry.status = UpstreamStatus::Ready(Arc::new(client));
                    entry.last_error = None;
                    self.metrics.record_connection_opened();
                    info!(upstream = %id, "upstream ready");
                    Ok(())
                }
                None => {
                    debug!(upstream = %id, "upstream removed while connecting");
                    let _ = client.cancel().await;
                    Err(RelayError::UpstreamNotFound(id.to_string()))
                }
            },
            Err(e) => {
                if let Some(mut entry) = self.entries.get_mut(id) {
                    entry.status = UpstreamStatus::Failed;
                    entry.last_error = Some(e.to_string());
                }
                self.metrics.record_connection_error();
                Err(e)
            }
        }
    }

    /// List tools from one Ready upstream, bounded by the refresh timeout.
    ///
    /// A timeout leaves the upstream Ready (slow but alive); a protocol error
    /// moves it to Failed so the next refresh reconnects.
    pub async fn list_tools(&self, id: &str) -> RelayResult<Vec<Tool>> {
        let client = self.ready_client(id)?;
        let timeout = Duration::from_secs(self.limits.list_timeout);
        match tokio::time::timeout(timeout, client.peer().list_all_tools()).await {
            Ok(Ok(tools)) => {
                debug!(upstream = %id, count = tools.len(), "listed upstream tools");
                Ok(tools)
            }
            Ok(Err(e)) => {
                let text = format!("tools/list failed on '{}': {}", id, e);
                self.mark_failed(id, &text);
                Err(RelayError::Protocol(text))
            }
            Err(_) => Err(RelayError::Transport(format!(
                "tools/list timed out on '{}' after {}s",
                id, self.limits.list_timeout
            ))),
        }
    }

    /// Forward a tool call to one upstream, bounded by the call timeout and
    /// the caller's cancellation token.
    pub async fn call_tool(
        &self,
        id: &str,
        tool_name: &str,
        arguments: Option<Map<String, Value>>,
        cancel: &CancellationToken,
    ) -> RelayResult<CallToolResult> {
        let client = self.ready_client(id)?;
        let request = CallToolRequestParam {
            name: Cow::Owned(tool_name.to_string()),
            arguments,
        };
        let timeout = Duration::from_secs(self.limits.call_timeout);

        debug!(upstream = %id, tool = %tool_name, "forwarding tool call");
        tokio::select! {
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            result = tokio::time::timeout(timeout, client.call_tool(request)) => match result {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(e)) => Err(RelayError::ToolExecution(format!(
                    "'{}' on '{}': {}",
                    tool_name, id, e
                ))),
                Err(_) => Err(RelayError::CallTimeout {
                    upstream: id.to_string(),
                    seconds: self.limits.call_timeout,
                }),
            },
        }
    }

    /// Record how many tools the catalog accepted from this upstream.
    pub fn set_tool_count(&self, id: &str, count: usize) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.tool_count = count;
        }
    }

    /// Per-upstream snapshots in configuration order.
    pub fn infos(&self) -> Vec<UpstreamInfo> {
        self.order
            .iter()
            .filter_map(|id| {
                let entry = self.entries.get(id)?;
                Some(UpstreamInfo {
                    id: id.clone(),
                    protocol: entry.config.transport.kind(),
                    endpoint: entry.config.transport.endpoint().to_string(),
                    state: entry.status.state(),
                    required: entry.config.required,
                    tool_count: entry.tool_count,
                    last_error: entry.last_error.clone(),
                })
            })
            .collect()
    }

    /// Disconnect every upstream. Clients still referenced by in-flight calls
    /// are logged and left to close when the call finishes.
    pub async fn shutdown(&self) {
        for id in &self.order {
            let Some((_, entry)) = self.entries.remove(id) else {
                continue;
            };
            if let UpstreamStatus::Ready(client) = entry.status {
                match Arc::try_unwrap(client) {
                    Ok(client) => {
                        if let Err(e) = client.cancel().await {
                            warn!(upstream = %id, error = %e, "error closing upstream connection");
                        }
                        self.metrics.record_connection_closed();
                    }
                    Err(_) => {
                        warn!(upstream = %id, "upstream client still in use at shutdown");
                    }
                }
            }
        }
    }

    fn ready_client(&self, id: &str) -> RelayResult<Arc<UpstreamClient>> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| RelayError::UpstreamNotFound(id.to_string()))?;
        match &entry.status {
            UpstreamStatus::Ready(client) => Ok(Arc::clone(client)),
            other => Err(RelayError::UpstreamNotReady(format!(
                "upstream '{}' is {}",
                id,
                other.state()
            ))),
        }
    }

    fn mark_failed(&self, id: &str, error_text: &str) {
        let previous = match self.entries.get_mut(id) {
            Some(mut entry) => {
                entry.last_error = Some(error_text.to_string());
                std::mem::replace(&mut entry.status, UpstreamStatus::Failed)
            }
            None => return,
        };

        if let UpstreamStatus::Ready(client) = previous {
            self.metrics.record_connection_closed();
            if let Ok(client) = Arc::try_unwrap(client) {
                tokio::spawn(async move {
                    let _ = client.cancel().await;
                });
            }
        }
        self.metrics.record_connection_error();
        warn!(upstream = %id, error = %error_text, "upstream moved to failed");
    }

    /// Hand a registered upstream an already-connected client.
    #[cfg(test)]
    pub(crate) fn install_ready(&self, id: &str, client: UpstreamClient) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.status = UpstreamStatus::Ready(Arc::new(client));
            entry.last_error = None;
            self.metrics.record_connection_opened();
        }
    }

    // ========================================================================
    // Connection establishment
    // ========================================================================

    async fn establish_with_retry(config: &UpstreamConfig) -> RelayResult<UpstreamClient> {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(8))
            .with_max_elapsed_time(Some(Duration::from_secs(30)))
            .build();

        backoff::future::retry(backoff, || async {
            match Self::establish(config).await {
                Ok(client) => Ok(client),
                Err(e) if Self::is_permanent_error(&e) => {
                    error!(upstream = %config.id, error = %e, "permanent connect error, not retrying");
                    Err(backoff::Error::permanent(e))
                }
                Err(e) => {
                    warn!(upstream = %config.id, error = %e, "connect failed, will retry");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await
    }

    /// Errors no amount of retrying will fix: bad configuration, a transport
    /// that cannot be constructed, or an upstream that rejects initialize.
    fn is_permanent_error(error: &RelayError) -> bool {
        match error {
            RelayError::Config(_) | RelayError::Transport(_) => true,
            RelayError::ConnectionFailed(msg) => {
                msg.contains("initialize") || msg.contains("unsupported") || msg.contains("invalid")
            }
            _ => false,
        }
    }

    async fn establish(config: &UpstreamConfig) -> RelayResult<UpstreamClient> {
        match &config.transport {
            UpstreamTransport::Stdio {
                command,
                args,
                envs,
            } => {
                let transport = TokioChildProcess::new(
                    tokio::process::Command::new(command).configure(|cmd| {
                        cmd.args(args)
                            .envs(envs.iter())
                            .stderr(Stdio::inherit());
                    }),
                )
                .map_err(|e| RelayError::Transport(format!("create stdio transport: {}", e)))?;

                ().serve(transport).await.map_err(|e| {
                    RelayError::ConnectionFailed(format!("initialize stdio client: {}", e))
                })
            }

            UpstreamTransport::Sse {
                url,
                token,
                headers,
            } => {
                let http_client = Self::build_http_client(token.as_deref(), headers)?;
                let sse_config = SseClientConfig {
                    sse_endpoint: url.clone().into(),
                    ..Default::default()
                };
                let transport = SseClientTransport::start_with_client(http_client, sse_config)
                    .await
                    .map_err(|e| RelayError::Transport(format!("create sse transport: {}", e)))?;

                ().serve(transport).await.map_err(|e| {
                    RelayError::ConnectionFailed(format!("initialize sse client: {}", e))
                })
            }

            UpstreamTransport::Streamable {
                url,
                token,
                headers,
            } => {
                let http_client = Self::build_http_client(token.as_deref(), headers)?;
                let cfg = StreamableHttpClientTransportConfig::with_uri(url.as_str());
                let transport = StreamableHttpClientTransport::with_client(http_client, cfg);

                ().serve(transport).await.map_err(|e| {
                    RelayError::ConnectionFailed(format!("initialize streamable client: {}", e))
                })
            }
        }
    }

    fn build_http_client(
        token: Option<&str>,
        headers: &HashMap<String, String>,
    ) -> RelayResult<reqwest::Client> {
        let mut header_map = reqwest::header::HeaderMap::new();
        if let Some(token) = token {
            let mut value = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| RelayError::Config(format!("invalid bearer token: {}", e)))?;
            value.set_sensitive(true);
            header_map.insert(reqwest::header::AUTHORIZATION, value);
        }
        for (name, value) in headers {
            let header_name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| RelayError::Config(format!("invalid header name '{}': {}", name, e)))?;
            let header_value = reqwest::header::HeaderValue::from_str(value).map_err(|e| {
                RelayError::Config(format!("invalid value for header '{}': {}", name, e))
            })?;
            header_map.insert(header_name, header_value);
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .default_headers(header_map)
            .build()?;
        Ok(client)
    }
}
