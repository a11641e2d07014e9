//! The tool registry: native tools plus whatever discovery contributed.
//!
//! Readers always see a complete snapshot. A discovery pass drops every
//! previously discovered tool, closes the MCP sessions that served them,
//! rebuilds the map from scratch and swaps it in as one `Arc`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use futures::future::join_all;
use kestrel_config::{AppConfig, McpServerConfig};
use kestrel_core::{DomainEvent, EventBus, FunctionDeclaration, Tool};
use tracing::{debug, error, info, warn};

use crate::context::ToolContext;
use crate::discovered::{DISCOVERY_TIMEOUT, SubprocessTool, run_discovery};
use crate::mcp::{
    McpApprovals, McpConnector, McpServerStatus, McpSession, McpTool, McpToolInfo,
    TransportConnector,
};
use crate::{ReadFileTool, ShellTool, WriteFileTool};

/// Longest tool name a model API accepts.
pub const MAX_TOOL_NAME_LEN: usize = 63;

type ToolMap = HashMap<String, Arc<dyn Tool>>;

/// Replace characters outside `[A-Za-z0-9_.-]` and shorten long names to
/// the first 28 and last 32 characters joined by `___`.
pub fn sanitize_tool_name(name: &str) -> String {
    let clean: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if clean.len() <= MAX_TOOL_NAME_LEN {
        return clean;
    }
    format!("{}___{}", &clean[..28], &clean[clean.len() - 32..])
}

pub struct ToolRegistry {
    natives: RwLock<ToolMap>,
    snapshot: RwLock<Arc<ToolMap>>,
    /// Serializes discovery passes.
    discovery: tokio::sync::Mutex<()>,
    sessions: tokio::sync::Mutex<Vec<Arc<dyn McpSession>>>,
    statuses: Mutex<BTreeMap<String, McpServerStatus>>,
    ctx: Arc<ToolContext>,
    discovery_command: Option<String>,
    call_command: Option<String>,
    mcp_servers: BTreeMap<String, McpServerConfig>,
    connector: Arc<dyn McpConnector>,
    approvals: Arc<McpApprovals>,
    core: Vec<String>,
    exclude: Vec<String>,
    events: Option<Arc<EventBus>>,
}

impl ToolRegistry {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self {
            natives: RwLock::new(HashMap::new()),
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            discovery: tokio::sync::Mutex::new(()),
            sessions: tokio::sync::Mutex::new(Vec::new()),
            statuses: Mutex::new(BTreeMap::new()),
            connector: Arc::new(TransportConnector::new(ctx.policy.clone())),
            ctx,
            discovery_command: None,
            call_command: None,
            mcp_servers: BTreeMap::new(),
            approvals: Arc::new(McpApprovals::default()),
            core: Vec::new(),
            exclude: Vec::new(),
            events: None,
        }
    }

    /// Registry with the built-in tools and every discovery source the
    /// configuration names. Nothing is discovered until
    /// [`discover_tools`](Self::discover_tools) runs.
    pub fn from_config(config: &AppConfig) -> Self {
        let ctx = Arc::new(ToolContext::from_config(config));
        let registry = Self::new(Arc::clone(&ctx))
            .with_discovery(
                config.tools.discovery_command.clone(),
                config.tools.call_command.clone(),
            )
            .with_mcp_servers(config.mcp_servers.clone())
            .with_filters(config.tools.core.clone(), config.tools.exclude.clone());
        registry.register_builtins();
        registry
    }

    pub fn with_discovery(mut self, discovery_command: Option<String>, call_command: Option<String>) -> Self {
        self.discovery_command = discovery_command;
        self.call_command = call_command;
        self
    }

    pub fn with_mcp_servers(mut self, servers: BTreeMap<String, McpServerConfig>) -> Self {
        {
            let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
            statuses.clear();
            statuses.extend(servers.keys().map(|k| (k.clone(), McpServerStatus::Disconnected)));
        }
        self.mcp_servers = servers;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn McpConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// `core` non-empty restricts tools to those names; `exclude` always removes.
    pub fn with_filters(mut self, core: Vec<String>, exclude: Vec<String>) -> Self {
        self.core = core;
        self.exclude = exclude;
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn context(&self) -> &Arc<ToolContext> {
        &self.ctx
    }

    fn is_enabled(&self, name: &str) -> bool {
        (self.core.is_empty() || self.core.iter().any(|c| c == name))
            && !self.exclude.iter().any(|e| e == name)
    }

    fn register_builtins(&self) {
        let builtins: [Arc<dyn Tool>; 3] = [
            Arc::new(ReadFileTool::new(Arc::clone(&self.ctx))),
            Arc::new(WriteFileTool::new(Arc::clone(&self.ctx))),
            Arc::new(ShellTool::new(Arc::clone(&self.ctx))),
        ];
        for tool in builtins {
            if self.is_enabled(tool.name()) {
                self.register_tool(tool);
            }
        }
    }

    /// Add a native tool. An existing tool with the same name is replaced.
    pub fn register_tool(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if let Ok(mut natives) = self.natives.write()
            && natives.insert(name.clone(), Arc::clone(&tool)).is_some()
        {
            warn!(tool = %name, "Tool already registered, overwriting");
        }
        let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        let mut next = ToolMap::clone(&snapshot);
        next.insert(name, tool);
        *snapshot = Arc::new(next);
    }

    fn natives(&self) -> ToolMap {
        self.natives
            .read()
            .map(|n| n.clone())
            .unwrap_or_default()
    }

    fn publish(&self, map: ToolMap) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *snapshot = Arc::new(map);
    }

    /// Swap in natives overlaid with `discovered`. Natives are read under
    /// the snapshot lock so a registration made during the pass survives.
    fn publish_discovered(&self, discovered: Vec<(String, Arc<dyn Tool>)>) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        let mut next = self.natives();
        for (name, tool) in discovered {
            if next.insert(name.clone(), tool).is_some() {
                debug!(tool = %name, "Discovered tool shadows a native tool");
            }
        }
        *snapshot = Arc::new(next);
    }

    fn set_status(&self, server: &str, status: McpServerStatus) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.insert(server.to_string(), status);
        }
        if let Some(events) = &self.events {
            events.publish(DomainEvent::McpServerStatusChanged {
                server: server.to_string(),
                status: status.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    fn discovered_event(&self, source: &str, tool_count: usize) {
        if let Some(events) = &self.events {
            events.publish(DomainEvent::ToolsDiscovered {
                source: source.to_string(),
                tool_count,
                timestamp: Utc::now(),
            });
        }
    }

    fn discovery_failed(&self, source: &str, message: String) {
        error!(source = %source, error = %message, "Tool discovery failed");
        if let Some(events) = &self.events {
            events.publish(DomainEvent::ErrorOccurred {
                context: format!("discovery:{source}"),
                error_message: message,
                timestamp: Utc::now(),
            });
        }
    }

    async fn close_sessions(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain(..).collect();
        for session in sessions {
            let name = session.server_name().to_string();
            self.set_status(&name, McpServerStatus::Closing);
            session.close().await;
            self.set_status(&name, McpServerStatus::Disconnected);
        }
    }

    /// Rebuild every discovered tool. Source failures are logged and
    /// contribute nothing; this never fails. Returns the number of tools
    /// discovery contributed.
    pub async fn discover_tools(&self) -> usize {
        let _guard = self.discovery.lock().await;

        self.publish(self.natives());
        self.close_sessions().await;

        // names taken so far; collisions are judged against this view
        let mut map = self.natives();
        let mut discovered: Vec<(String, Arc<dyn Tool>)> = Vec::new();
        let mut contributed = 0;

        for tool in self.discover_subprocess_tools().await {
            let name = tool.name().to_string();
            if !self.is_enabled(&name) {
                continue;
            }
            if map.insert(name.clone(), Arc::clone(&tool)).is_some() {
                warn!(tool = %name, "Discovered tool overrides an existing tool");
            }
            discovered.push((name, tool));
            contributed += 1;
        }

        let connections = join_all(
            self.mcp_servers
                .iter()
                .map(|(name, config)| self.connect_server(name, config)),
        )
        .await;

        let mut sessions = self.sessions.lock().await;
        for (server, connected) in connections {
            let Some((session, tools)) = connected else {
                continue;
            };
            let trust = self.mcp_servers.get(&server).is_some_and(|c| c.trust);
            let mut count = 0;
            for info in tools {
                let mut name = sanitize_tool_name(&info.name);
                if map.contains_key(&name) {
                    name = sanitize_tool_name(&format!("{server}__{}", info.name));
                }
                if !self.is_enabled(&name) {
                    continue;
                }
                let tool: Arc<dyn Tool> = Arc::new(
                    McpTool::new(name.clone(), info, Arc::clone(&session), Arc::clone(&self.approvals))
                        .trusted(trust)
                        .with_approval_mode(self.ctx.approval_mode),
                );
                if map.insert(name.clone(), Arc::clone(&tool)).is_some() {
                    warn!(tool = %name, server = %server, "MCP tool name collides, overwriting");
                }
                discovered.push((name, tool));
                count += 1;
            }
            info!(server = %server, tools = count, "Registered MCP tools");
            self.discovered_event(&server, count);
            contributed += count;
            sessions.push(session);
        }
        drop(sessions);

        self.publish_discovered(discovered);
        contributed
    }

    async fn discover_subprocess_tools(&self) -> Vec<Arc<dyn Tool>> {
        let Some(command) = &self.discovery_command else {
            return Vec::new();
        };
        let declarations =
            match run_discovery(command, &self.ctx.policy, &self.ctx.target_dir, DISCOVERY_TIMEOUT).await {
                Ok(d) => d,
                Err(e) => {
                    self.discovery_failed("subprocess", e.to_string());
                    return Vec::new();
                }
            };

        let Some(call_command) = &self.call_command else {
            if !declarations.is_empty() {
                self.discovery_failed(
                    "subprocess",
                    format!("{} tools discovered but no call command is configured", declarations.len()),
                );
            }
            return Vec::new();
        };

        let mut tools: Vec<Arc<dyn Tool>> = Vec::with_capacity(declarations.len());
        for declaration in declarations {
            match SubprocessTool::new(declaration, call_command, &self.ctx.policy, &self.ctx.target_dir) {
                Ok(tool) => tools.push(Arc::new(tool)),
                Err(reason) => {
                    self.discovery_failed("subprocess", format!("call command refused: {reason}"));
                    return Vec::new();
                }
            }
        }
        self.discovered_event("subprocess", tools.len());
        tools
    }

    async fn connect_server(
        &self,
        name: &str,
        config: &McpServerConfig,
    ) -> (String, Option<(Arc<dyn McpSession>, Vec<McpToolInfo>)>) {
        self.set_status(name, McpServerStatus::Connecting);
        let session = match self.connector.connect(name, config).await {
            Ok(s) => s,
            Err(e) => {
                self.set_status(name, McpServerStatus::Disconnected);
                self.discovery_failed(name, e.to_string());
                return (name.to_string(), None);
            }
        };
        match session.list_tools().await {
            Ok(tools) => {
                self.set_status(name, McpServerStatus::Connected);
                debug!(server = %name, count = tools.len(), "MCP server listed tools");
                (name.to_string(), Some((session, tools)))
            }
            Err(e) => {
                session.close().await;
                self.set_status(name, McpServerStatus::Disconnected);
                self.discovery_failed(name, e.to_string());
                (name.to_string(), None)
            }
        }
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.snapshot().get(name).cloned()
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<ToolMap> {
        self.snapshot
            .read()
            .map(|s| Arc::clone(&s))
            .unwrap_or_default()
    }

    /// All tools, sorted by name.
    pub fn get_all_tools(&self) -> Vec<Arc<dyn Tool>> {
        let mut tools: Vec<_> = self.snapshot().values().cloned().collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// Declarations for the model, sorted by name.
    pub fn get_function_declarations(&self) -> Vec<FunctionDeclaration> {
        self.get_all_tools()
            .iter()
            .map(|t| t.to_declaration())
            .collect()
    }

    pub fn mcp_server_statuses(&self) -> BTreeMap<String, McpServerStatus> {
        self.statuses
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Close every MCP session. MCP tools stay registered but fail to call.
    pub async fn shutdown(&self) {
        self.close_sessions().await;
    }
}
