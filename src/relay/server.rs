//! The relay server: one client session in front of many upstreams.
//!
//! Everything that crosses the relay gets screened before it moves on. Tool
//! definitions are screened before they enter the advertised catalog,
//! arguments before the upstream call happens, and the response before it
//! goes back to the client. The scan gateway produces verdicts; the policy
//! enforcer turns them into forward-or-block decisions, and anything other
//! than an explicit allow is withheld.

use std::{borrow::Cow, sync::Arc, time::Duration};

use futures::future::join_all;
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, Content, InitializeRequestParam, InitializeResult,
        ListToolsResult, PaginatedRequestParam, ServerCapabilities, ServerInfo, Tool,
    },
    service::{NotificationContext, RequestContext},
    ErrorData, RoleServer, ServerHandler,
};
use serde_json::{json, Map, Value};
use tokio::{sync::Semaphore, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    catalog::{build_snapshot, CatalogSnapshot, ToolCatalog},
    config::{LimitsConfig, RelayConfig},
    error::{RelayError, RelayResult},
    metrics::RelayMetrics,
    policy::{PolicyAction, PolicyEnforcer},
    relay::session::{SessionPhase, SessionState},
    scan::{HttpScanner, MemoryVerdictCache, ScanGateway, ScanUnit, ScanUnitKind},
    upstream::UpstreamManager,
};

/// Name of the locally served diagnostics tool. Upstream tools that claim it
/// are force-qualified during catalog builds.
pub const INFO_TOOL_NAME: &str = "list_downstream_servers_info";

/// Security-scanning relay between one MCP client session and a set of
/// upstream MCP servers.
#[derive(Clone)]
pub struct SecurityRelay {
    upstreams: Arc<UpstreamManager>,
    gateway: Arc<ScanGateway>,
    catalog: Arc<ToolCatalog>,
    policy: Arc<PolicyEnforcer>,
    session: Arc<SessionState>,
    metrics: Arc<RelayMetrics>,
    limits: LimitsConfig,
    call_permits: Arc<Semaphore>,
}

impl SecurityRelay {
    /// Build the relay from a validated configuration. Upstreams start
    /// disconnected; call [`connect_upstreams`](Self::connect_upstreams)
    /// before serving.
    pub fn from_config(config: RelayConfig) -> RelayResult<Self> {
        let metrics = Arc::new(RelayMetrics::new());
        let upstreams = Arc::new(UpstreamManager::new(
            config.upstreams,
            config.limits.clone(),
            Arc::clone(&metrics),
        ));
        let scanner = Arc::new(HttpScanner::from_config(&config.scanner)?);
        let cache = Arc::new(MemoryVerdictCache::new(
            config.cache.capacity,
            Duration::from_secs(config.cache.ttl),
        ));
        let gateway = Arc::new(ScanGateway::new(scanner, cache, Arc::clone(&metrics)));
        let call_permits = Arc::new(Semaphore::new(config.limits.max_concurrent_calls));

        Ok(Self {
            upstreams,
            gateway,
            catalog: Arc::new(ToolCatalog::new()),
            policy: Arc::new(PolicyEnforcer::new(config.policy.notice_verbosity)),
            session: Arc::new(SessionState::new()),
            metrics,
            limits: config.limits,
            call_permits,
        })
    }

    /// Connect every configured upstream. Fails only when a required
    /// upstream cannot be reached.
    pub async fn connect_upstreams(&self) -> RelayResult<()> {
        self.upstreams.connect_all().await
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Rebuild the merged catalog from live upstreams.
    ///
    /// Each upstream is listed concurrently under its own timeout, its tool
    /// definitions are screened, and the surviving entries are merged with
    /// deterministic collision qualification. An upstream that fails to list
    /// contributes nothing this round; its tools reappear once it recovers.
    /// A cancelled request installs nothing: the previously advertised
    /// snapshot stays in place for everyone else.
    pub async fn refresh_catalog(
        &self,
        cancel: &CancellationToken,
    ) -> RelayResult<Arc<CatalogSnapshot>> {
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }
        self.metrics.record_refresh_round();
        self.upstreams.reconnect_stale().await;

        let ids = self.upstreams.ids();
        let listings = join_all(ids.iter().map(|id| async move {
            match self.upstreams.list_tools(id).await {
                Ok(tools) => Some((id.clone(), tools)),
                Err(e) => {
                    warn!(upstream = %id, error = %e, "catalog refresh skipped upstream");
                    None
                }
            }
        }))
        .await;

        let mut per_upstream = Vec::with_capacity(ids.len());
        for (id, tools) in listings.into_iter().flatten() {
            let screened = self.screen_definitions(&id, tools, cancel).await?;
            per_upstream.push((id, screened));
        }
        // Cached verdicts resolve even under a cancelled token, so this can
        // be reached with every unit screened; re-check before publishing.
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        for (id, tools) in &per_upstream {
            self.upstreams.set_tool_count(id, tools.len());
        }
        let snapshot = build_snapshot(per_upstream, &[INFO_TOOL_NAME]);
        Ok(self.catalog.install(snapshot))
    }

    /// Screen one upstream's tool definitions, dropping everything that is
    /// not explicitly allowed. A cancelled scan aborts the whole round
    /// instead of counting as a block.
    async fn screen_definitions(
        &self,
        upstream_id: &str,
        tools: Vec<Tool>,
        cancel: &CancellationToken,
    ) -> RelayResult<Vec<Tool>> {
        let screened = join_all(tools.into_iter().map(|tool| async move {
            let unit = ScanUnit::tool_definition(upstream_id, &tool);
            let outcome = self.gateway.verdict_for(&unit, cancel).await;
            if matches!(outcome, Err(RelayError::Cancelled)) {
                return Err(RelayError::Cancelled);
            }
            match self.policy.decide(outcome) {
                PolicyAction::Forward => Ok(Some(tool)),
                PolicyAction::Block(reason) => {
                    self.metrics.record_definition_blocked();
                    warn!(
                        upstream = %upstream_id,
                        tool = %tool.name,
                        reason = %reason,
                        "tool definition withheld from catalog"
                    );
                    Ok(None)
                }
            }
        }))
        .await;

        let mut kept = Vec::with_capacity(screened.len());
        for outcome in screened {
            if let Some(tool) = outcome? {
                kept.push(tool);
            }
        }
        Ok(kept)
    }

    /// Tools advertised to the client: the screened merged catalog plus the
    /// locally served info tool. Listings occupy the same in-flight gauge as
    /// calls so shutdown drains them too.
    pub async fn advertised_tools(&self, cancel: &CancellationToken) -> RelayResult<Vec<Tool>> {
        self.metrics.record_request_start();
        let metrics = Arc::clone(&self.metrics);
        let _listing = scopeguard::guard((), move |_| metrics.record_request_end());

        let snapshot = self.refresh_catalog(cancel).await?;
        let mut tools = snapshot.tools();
        tools.push(Self::info_tool());
        Ok(tools)
    }

    /// Execute one tool call end to end: resolve the exposed name, screen
    /// the arguments, forward, screen the response.
    ///
    /// Arguments are screened before any bytes reach the upstream, and the
    /// response is screened before any bytes reach the client. A block at
    /// either stage yields a notice result instead of the real payload.
    pub async fn execute_call(
        &self,
        exposed_name: &str,
        arguments: Option<Map<String, Value>>,
        cancel: &CancellationToken,
    ) -> RelayResult<CallToolResult> {
        let snapshot = self.catalog.snapshot();
        let entry = snapshot
            .resolve(exposed_name)
            .ok_or_else(|| RelayError::ToolNotFound(exposed_name.to_string()))?;
        let upstream_id = entry.qualified.upstream_id.clone();
        let tool_name = entry.qualified.tool_name.clone();
        drop(snapshot);

        let argument_value = Value::Object(arguments.clone().unwrap_or_default());
        let unit = ScanUnit::tool_arguments(&upstream_id, &tool_name, argument_value);
        let outcome = self.gateway.verdict_for(&unit, cancel).await;
        if matches!(outcome, Err(RelayError::Cancelled)) {
            return Err(RelayError::Cancelled);
        }
        if let PolicyAction::Block(reason) = self.policy.decide(outcome) {
            self.metrics.record_call_blocked();
            warn!(
                upstream = %upstream_id,
                tool = %tool_name,
                reason = %reason,
                "tool call blocked before forwarding"
            );
            return Ok(self
                .policy
                .block_result(ScanUnitKind::ToolArguments, exposed_name, &reason));
        }

        let result = self
            .upstreams
            .call_tool(&upstream_id, &tool_name, arguments, cancel)
            .await?;

        self.screen_response(&upstream_id, &tool_name, exposed_name, result, cancel)
            .await
    }

    /// Screen a tool response before it is returned to the client. The whole
    /// result is serialized so structured content is screened along with the
    /// text blocks.
    async fn screen_response(
        &self,
        upstream_id: &str,
        tool_name: &str,
        exposed_name: &str,
        result: CallToolResult,
        cancel: &CancellationToken,
    ) -> RelayResult<CallToolResult> {
        let payload = serde_json::to_value(&result)
            .map_err(|e| RelayError::Protocol(format!("unserializable tool result: {e}")))?;
        let unit = ScanUnit::tool_response(upstream_id, tool_name, payload);
        let outcome = self.gateway.verdict_for(&unit, cancel).await;
        if matches!(outcome, Err(RelayError::Cancelled)) {
            return Err(RelayError::Cancelled);
        }
        match self.policy.decide(outcome) {
            PolicyAction::Forward => Ok(result),
            PolicyAction::Block(reason) => {
                self.metrics.record_response_blocked();
                warn!(
                    upstream = %upstream_id,
                    tool = %tool_name,
                    reason = %reason,
                    "tool response withheld from client"
                );
                Ok(self
                    .policy
                    .block_result(ScanUnitKind::ToolResponse, exposed_name, &reason))
            }
        }
    }

    /// Diagnostics tool served by the relay itself. Never forwarded and
    /// never scanned; it carries no upstream content.
    fn serve_info_tool(&self) -> RelayResult<CallToolResult> {
        let report = json!({
            "generated_at": chrono::Utc::now().to_rfc3339(),
            "upstreams": self.upstreams.infos(),
            "metrics": self.metrics.snapshot(),
        });
        let text = serde_json::to_string_pretty(&report)
            .map_err(|e| RelayError::Protocol(format!("info report serialization: {e}")))?;
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    fn info_tool() -> Tool {
        let schema = json!({
            "type": "object",
            "properties": {}
        });
        let schema_map = match schema {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        Tool {
            name: Cow::Borrowed(INFO_TOOL_NAME),
            title: None,
            description: Some(Cow::Borrowed(
                "Connection state, tool counts, and scan statistics for every \
                 upstream server behind this relay. Served locally; nothing is \
                 forwarded upstream.",
            )),
            input_schema: Arc::new(schema_map),
            output_schema: None,
            annotations: None,
            icons: None,
        }
    }

    /// Drain in-flight calls and listings within the configured grace
    /// period, then tear down upstream connections.
    pub async fn shutdown(&self) {
        if !self.session.begin_closing() {
            return;
        }
        info!("relay shutting down, draining in-flight requests");
        self.call_permits.close();

        let deadline = Instant::now() + Duration::from_secs(self.limits.shutdown_grace);
        while self.metrics.snapshot().active_requests > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let leftover = self.metrics.snapshot().active_requests;
        if leftover > 0 {
            warn!(count = leftover, "grace period expired with requests still in flight");
        }

        self.upstreams.shutdown().await;
        self.session.mark_closed();
        info!("relay shutdown complete");
    }

    fn require_active(&self) -> Result<(), ErrorData> {
        if self.session.activate_on_request() {
            Ok(())
        } else {
            Err(ErrorData::invalid_request(
                format!("session is {}", self.session.phase()),
                None,
            ))
        }
    }

    fn to_error_data(&self, error: RelayError) -> ErrorData {
        match error {
            RelayError::ToolNotFound(name) => {
                ErrorData::invalid_params(format!("unknown tool: {name}"), None)
            }
            RelayError::Cancelled => ErrorData::internal_error("request cancelled", None),
            other => ErrorData::internal_error(other.to_string(), None),
        }
    }
}

impl ServerHandler for SecurityRelay {
    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info.server_info.name = "mcp-scan-relay".into();
        info.server_info.version = env!("CARGO_PKG_VERSION").into();
        info.instructions = Some(
            "Relay aggregating tools from multiple MCP servers. Every tool \
             definition, call, and response is security-scanned; blocked \
             content is replaced by a notice."
                .into(),
        );
        info
    }

    async fn initialize(
        &self,
        request: InitializeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, ErrorData> {
        if !self.session.mark_initialized() {
            return Err(ErrorData::invalid_request(
                format!("initialize received in {} phase", self.session.phase()),
                None,
            ));
        }
        info!(
            client = %request.client_info.name,
            version = %request.client_info.version,
            "client session initialized"
        );
        Ok(self.get_info())
    }

    async fn on_initialized(&self, _context: NotificationContext<RoleServer>) {
        if self.session.mark_active() {
            info!("client session active");
        } else if self.session.phase() == SessionPhase::Active {
            // A request between the handshake reply and this notification
            // already promoted the session.
            debug!("initialized notification after first request");
        } else {
            warn!(
                phase = %self.session.phase(),
                "ignoring initialized notification out of phase"
            );
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        self.require_active()?;
        let tools = self
            .advertised_tools(&context.ct)
            .await
            .map_err(|e| self.to_error_data(e))?;
        debug!(count = tools.len(), "advertising tools");
        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        self.require_active()?;

        if request.name == INFO_TOOL_NAME {
            return self.serve_info_tool().map_err(|e| self.to_error_data(e));
        }

        let _permit = Arc::clone(&self.call_permits)
            .acquire_owned()
            .await
            .map_err(|_| ErrorData::invalid_request("relay is shutting down", None))?;

        self.metrics.record_call_start();
        let metrics = Arc::clone(&self.metrics);
        let mut completed = scopeguard::guard(false, move |success| {
            metrics.record_call_end(success);
        });

        let result = self
            .execute_call(&request.name, request.arguments, &context.ct)
            .await;
        if result.is_ok() {
            *completed = true;
        }
        result.map_err(|e| self.to_error_data(e))
    }
}
