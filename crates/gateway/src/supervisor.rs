//! Long-lived per-server subprocess supervision.
//!
//! Each configured server gets one [`ServerInstance`] that owns a single
//! subprocess, independent of any client session. The instance performs its
//! own MCP handshake (request id 1) and tool discovery (request id 999),
//! keeps a bounded ring of recent output, health-checks the process, and
//! auto-restarts crashed servers that are flagged auto-start.

use crate::config::ServerDefinition;
use crate::error::{GatewayError, Result};
use crate::permissions::{self, PermissionCategory, PermissionSet};
use crate::proc;
use crate::protocol;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;

pub const MAX_OUTPUT_LINES: usize = 500;

const MAX_RESTARTS: u32 = 3;
const RESTART_PAUSE: Duration = Duration::from_secs(1);
const CRASH_RESTART_DELAY: Duration = Duration::from_secs(2);
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
    Error,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Stopped => "Stopped",
            InstanceStatus::Starting => "Starting...",
            InstanceStatus::Running => "Running",
            InstanceStatus::Stopping => "Stopping...",
            InstanceStatus::Crashed => "Crashed",
            InstanceStatus::Error => "Error",
        };
        f.write_str(s)
    }
}

/// One tool as declared by the subprocess at discovery time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub input_schema: Value,
    /// Categories the subprocess itself declared for this tool.
    pub permissions: Vec<PermissionCategory>,
}

#[derive(Debug, Clone)]
pub enum InstanceEvent {
    StatusChanged {
        server: String,
        status: InstanceStatus,
    },
    Output {
        server: String,
        line: String,
    },
    ErrorOutput {
        server: String,
        line: String,
    },
    ToolsChanged {
        server: String,
    },
    Error {
        server: String,
        message: String,
    },
}

pub struct ServerInstance {
    name: String,
    definition: RwLock<ServerDefinition>,
    status: RwLock<InstanceStatus>,
    last_error: RwLock<Option<String>>,
    tools: RwLock<Vec<ToolDescriptor>>,
    output: Mutex<VecDeque<String>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pid: RwLock<Option<i32>>,
    restart_count: AtomicU32,
    intentional_stop: AtomicBool,
    initialized: AtomicBool,
    pending_refresh: AtomicBool,
    events: mpsc::UnboundedSender<InstanceEvent>,
}

impl ServerInstance {
    pub fn new(
        definition: ServerDefinition,
        events: mpsc::UnboundedSender<InstanceEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: definition.name.clone(),
            definition: RwLock::new(definition),
            status: RwLock::new(InstanceStatus::Stopped),
            last_error: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            output: Mutex::new(VecDeque::with_capacity(MAX_OUTPUT_LINES)),
            stdin: tokio::sync::Mutex::new(None),
            pid: RwLock::new(None),
            restart_count: AtomicU32::new(0),
            intentional_stop: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            pending_refresh: AtomicBool::new(false),
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> ServerDefinition {
        self.definition.read().clone()
    }

    pub fn status(&self) -> InstanceStatus {
        *self.status.read()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.status(),
            InstanceStatus::Running | InstanceStatus::Starting
        )
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn pid(&self) -> Option<i32> {
        *self.pid.read()
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().clone()
    }

    /// Up to `lines` most recent output lines, oldest first.
    pub fn recent_output(&self, lines: usize) -> Vec<String> {
        let buffer = self.output.lock();
        let skip = buffer.len().saturating_sub(lines);
        buffer.iter().skip(skip).cloned().collect()
    }

    /// Replace the stored definition. Rejected while the process runs.
    pub fn update_definition(&self, definition: ServerDefinition) -> Result<()> {
        if self.status() != InstanceStatus::Stopped {
            return Err(GatewayError::Runtime(format!(
                "cannot update '{}' while it is running",
                self.name
            )));
        }
        *self.definition.write() = definition;
        Ok(())
    }

    pub fn set_permission(&self, category: PermissionCategory, value: Option<bool>) {
        self.definition.write().permissions.set(category, value);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the subprocess. Resets the restart counter; automatic restart
    /// attempts go through [`ServerInstance::restart`] instead.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.restart_count.store(0, Ordering::SeqCst);
        self.spawn_process().await
    }

    /// Stop gracefully: SIGTERM, bounded wait, SIGKILL.
    pub async fn stop(&self) {
        let status = self.status();
        if status == InstanceStatus::Stopped || status == InstanceStatus::Stopping {
            return;
        }
        self.set_status(InstanceStatus::Stopping);
        self.initialized.store(false, Ordering::SeqCst);
        self.pending_refresh.store(false, Ordering::SeqCst);
        self.intentional_stop.store(true, Ordering::SeqCst);

        *self.stdin.lock().await = None;
        if let Some(pid) = self.pid() {
            tracing::info!(server = %self.name, pid, "stopping server");
            proc::terminate_and_reap(pid).await;
        }

        // The flag stays up until the next spawn; the exit watcher may
        // observe the death after this method returns.
        self.set_status(InstanceStatus::Stopped);
    }

    /// Stop then start again. Bounded by the maximum restart budget; once
    /// exceeded the instance goes to `Error` and stays there.
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        let attempts = self.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
        if attempts > MAX_RESTARTS {
            let message = format!("max restart attempts ({MAX_RESTARTS}) reached");
            self.fail(&message);
            return Err(GatewayError::Runtime(message));
        }
        tracing::info!(server = %self.name, attempt = attempts, "restarting server");
        self.stop().await;
        tokio::time::sleep(RESTART_PAUSE).await;
        self.spawn_process().await
    }

    /// Immediate SIGKILL, no graceful window.
    pub async fn kill(&self) {
        self.intentional_stop.store(true, Ordering::SeqCst);
        *self.stdin.lock().await = None;
        if let Some(pid) = self.pid() {
            tracing::warn!(server = %self.name, pid, "killing server");
            proc::force_kill(pid);
            proc::wait_until_gone(pid, Duration::from_secs(2)).await;
        }
        self.set_status(InstanceStatus::Stopped);
    }

    async fn spawn_process(self: &Arc<Self>) -> Result<()> {
        let status = self.status();
        if status == InstanceStatus::Running || status == InstanceStatus::Starting {
            return Err(GatewayError::Runtime(format!(
                "server '{}' is already running",
                self.name
            )));
        }

        let definition = self.definition();
        if definition.command.trim().is_empty() {
            let message = "no command specified in configuration".to_string();
            self.fail(&message);
            return Err(GatewayError::Startup(message));
        }

        if port_in_use(definition.port).await {
            let message = format!("port {} is already in use", definition.port);
            self.fail(&message);
            return Err(GatewayError::Startup(message));
        }

        self.intentional_stop.store(false, Ordering::SeqCst);
        self.set_status(InstanceStatus::Starting);

        let mut command = Command::new(&definition.command);
        command
            .args(&definition.arguments)
            .envs(&definition.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = definition.working_dir.as_deref().filter(|d| !d.is_empty()) {
            command.current_dir(dir);
        }

        tracing::info!(
            server = %self.name,
            command = %definition.command,
            args = ?definition.arguments,
            "starting server"
        );

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to start: {e}");
                self.fail(&message);
                return Err(GatewayError::Startup(message));
            }
        };

        let pid = child.id().map(|p| p as i32);
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        *self.pid.write() = pid;
        *self.stdin.lock().await = stdin;
        self.initialized.store(false, Ordering::SeqCst);

        self.set_status(InstanceStatus::Running);
        tracing::info!(server = %self.name, ?pid, "server started");

        if let Some(stdout) = stdout {
            self.spawn_stdout_reader(stdout);
        }
        if let Some(stderr) = stderr {
            self.spawn_stderr_reader(stderr);
        }
        self.spawn_exit_watcher(child);
        if let Some(pid) = pid {
            self.spawn_health_check(pid, definition.health_check_interval);
        }

        // Kick off the handshake so tool discovery completes on its own.
        if let Err(e) = self.refresh_tools().await {
            tracing::warn!(server = %self.name, error = %e, "initial tools refresh failed");
        }

        Ok(())
    }

    fn fail(&self, message: &str) {
        tracing::warn!(server = %self.name, message, "server error");
        *self.last_error.write() = Some(message.to_string());
        self.set_status(InstanceStatus::Error);
        let _ = self.events.send(InstanceEvent::Error {
            server: self.name.clone(),
            message: message.to_string(),
        });
    }

    fn set_status(&self, status: InstanceStatus) {
        {
            let mut current = self.status.write();
            if *current == status {
                return;
            }
            *current = status;
        }
        tracing::info!(server = %self.name, status = %status, "status changed");
        let _ = self.events.send(InstanceEvent::StatusChanged {
            server: self.name.clone(),
            status,
        });
    }

    // ------------------------------------------------------------------
    // Subprocess I/O
    // ------------------------------------------------------------------

    fn spawn_stdout_reader(self: &Arc<Self>, stdout: ChildStdout) {
        let instance = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                instance.handle_stdout_line(line.trim()).await;
            }
        });
    }

    fn spawn_stderr_reader(self: &Arc<Self>, stderr: ChildStderr) {
        let instance = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                tracing::warn!(server = %instance.name, "stderr: {line}");
                instance.push_output(line);
                let _ = instance.events.send(InstanceEvent::ErrorOutput {
                    server: instance.name.clone(),
                    line: line.to_string(),
                });
            }
        });
    }

    fn spawn_exit_watcher(self: &Arc<Self>, mut child: Child) {
        let instance = Arc::clone(self);
        let pid = child.id().map(|p| p as i32);
        tokio::spawn(async move {
            let status = child.wait().await.ok();
            instance.handle_exit(pid, status).await;
        });
    }

    fn spawn_health_check(self: &Arc<Self>, pid: i32, interval_ms: u64) {
        if interval_ms == 0 {
            return;
        }
        let instance = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if instance.pid() != Some(pid) {
                    return;
                }
                if instance.status() == InstanceStatus::Running && !proc::is_alive(pid) {
                    // The exit watcher owns restart handling; this is the
                    // fast path for a death the OS has not delivered yet.
                    tracing::warn!(server = %instance.name, "health check failed, process gone");
                    instance.set_status(InstanceStatus::Crashed);
                    return;
                }
            }
        });
    }

    async fn handle_exit(self: &Arc<Self>, pid: Option<i32>, status: Option<std::process::ExitStatus>) {
        // A restart may already have replaced this process.
        if pid.is_some() && *self.pid.read() != pid {
            tracing::debug!(server = %self.name, ?pid, "stale exit watcher, ignoring");
            return;
        }
        *self.pid.write() = None;
        *self.stdin.lock().await = None;
        self.initialized.store(false, Ordering::SeqCst);
        self.pending_refresh.store(false, Ordering::SeqCst);

        if self.intentional_stop.load(Ordering::SeqCst) {
            tracing::debug!(server = %self.name, "server stopped intentionally");
            self.set_status(InstanceStatus::Stopped);
            return;
        }

        // Exit by signal is a crash; a normal exit, even non-zero, is not.
        let crashed = status.map_or(true, |s| s.code().is_none());
        if !crashed {
            tracing::info!(server = %self.name, exit = ?status.and_then(|s| s.code()), "server exited");
            self.set_status(InstanceStatus::Stopped);
            return;
        }

        let message = "process terminated unexpectedly".to_string();
        *self.last_error.write() = Some(message.clone());
        self.set_status(InstanceStatus::Crashed);
        let _ = self.events.send(InstanceEvent::Error {
            server: self.name.clone(),
            message,
        });

        let definition = self.definition();
        if definition.auto_start && self.restart_count.load(Ordering::SeqCst) < MAX_RESTARTS {
            tracing::info!(server = %self.name, "scheduling auto-restart");
            let instance = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(CRASH_RESTART_DELAY).await;
                if let Err(e) = instance.restart().await {
                    tracing::warn!(server = %instance.name, error = %e, "auto-restart failed");
                }
            });
        }
    }

    async fn handle_stdout_line(self: &Arc<Self>, line: &str) {
        if line.is_empty() {
            return;
        }

        if line.starts_with('{') {
            if let Ok(msg) = serde_json::from_str::<Value>(line) {
                if protocol::has_id(&msg, protocol::SUPERVISOR_INIT_ID)
                    && msg.get("result").is_some()
                {
                    self.complete_handshake().await;
                    return;
                }
                if protocol::has_id(&msg, protocol::TOOLS_QUERY_ID)
                    && msg.get("result").is_some()
                {
                    self.apply_tools_response(&msg);
                    return;
                }
            }
        }

        self.push_output(line);
        let _ = self.events.send(InstanceEvent::Output {
            server: self.name.clone(),
            line: line.to_string(),
        });
    }

    async fn complete_handshake(self: &Arc<Self>) {
        tracing::debug!(server = %self.name, "initialize handshake complete");
        self.initialized.store(true, Ordering::SeqCst);

        let notification =
            protocol::notification("notifications/initialized", Value::Null);
        if let Err(e) = self.send_line(&notification).await {
            tracing::warn!(server = %self.name, error = %e, "failed to send initialized notification");
            return;
        }

        if self.pending_refresh.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.refresh_tools().await {
                tracing::warn!(server = %self.name, error = %e, "deferred tools refresh failed");
            }
        }
    }

    fn apply_tools_response(&self, msg: &Value) {
        let tools = parse_tool_descriptors(&msg["result"]);
        tracing::info!(server = %self.name, count = tools.len(), "tool list updated");
        *self.tools.write() = tools;
        let _ = self.events.send(InstanceEvent::ToolsChanged {
            server: self.name.clone(),
        });
    }

    fn push_output(&self, line: &str) {
        let mut buffer = self.output.lock();
        if buffer.len() == MAX_OUTPUT_LINES {
            buffer.pop_front();
        }
        buffer.push_back(line.to_string());
    }

    async fn send_line(&self, msg: &Value) -> Result<()> {
        let mut line = serde_json::to_string(msg)
            .map_err(|e| GatewayError::Runtime(e.to_string()))?;
        line.push('\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| GatewayError::Runtime("server stdin is closed".into()))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tool discovery and management
    // ------------------------------------------------------------------

    /// Request a fresh tool list. If the handshake has not completed yet,
    /// send `initialize` first and finish the refresh once it answers.
    pub async fn refresh_tools(&self) -> Result<()> {
        if self.status() != InstanceStatus::Running {
            return Err(GatewayError::Runtime(format!(
                "server '{}' is not running",
                self.name
            )));
        }

        if !self.initialized.load(Ordering::SeqCst) {
            self.pending_refresh.store(true, Ordering::SeqCst);
            return self
                .send_line(&protocol::initialize_request(protocol::SUPERVISOR_INIT_ID))
                .await;
        }

        self.send_line(&protocol::request(
            json!(protocol::TOOLS_QUERY_ID),
            "tools/list",
            Value::Null,
        ))
        .await
    }

    /// A tool with no descriptor counts as enabled.
    pub fn is_tool_enabled(&self, tool: &str) -> bool {
        self.tools
            .read()
            .iter()
            .find(|t| t.name == tool)
            .map_or(true, |t| t.enabled)
    }

    pub fn set_tool_enabled(&self, tool: &str, enabled: bool) {
        let mut tools = self.tools.write();
        match tools.iter_mut().find(|t| t.name == tool) {
            Some(descriptor) => {
                descriptor.enabled = enabled;
                tracing::info!(server = %self.name, tool, enabled, "tool toggled");
            }
            None => {
                tracing::warn!(server = %self.name, tool, "unknown tool, cannot toggle");
            }
        }
    }

    /// Category check for one tool call. Unknown tools pass (there is
    /// nothing to check against); known tools must have every declared
    /// category resolve true. Returns the first missing category.
    pub fn check_tool_permission(
        &self,
        tool: &str,
        global: &PermissionSet,
    ) -> std::result::Result<(), PermissionCategory> {
        let declared: Vec<PermissionCategory> = {
            let tools = self.tools.read();
            match tools.iter().find(|t| t.name == tool) {
                Some(descriptor) => descriptor.permissions.clone(),
                None => return Ok(()),
            }
        };
        let server_overrides = self.definition.read().permissions.clone();
        for category in declared {
            if !permissions::resolve(category, &[global, &server_overrides]) {
                return Err(category);
            }
        }
        Ok(())
    }
}

/// Probe whether something already listens on the configured port.
async fn port_in_use(port: u16) -> bool {
    if port == 0 {
        return false;
    }
    matches!(
        tokio::time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Parse a `tools/list` result into descriptors. Declared categories live
/// under `permissions.categories`; unknown category names are dropped.
fn parse_tool_descriptors(result: &Value) -> Vec<ToolDescriptor> {
    let Some(items) = result.get("tools").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let name = item.get("name")?.as_str()?.to_string();
            let categories = item
                .get("permissions")
                .and_then(|p| p.get("categories"))
                .and_then(Value::as_array)
                .map(|cats| {
                    cats.iter()
                        .filter_map(Value::as_str)
                        .filter_map(PermissionCategory::parse)
                        .collect()
                })
                .unwrap_or_default();
            Some(ToolDescriptor {
                name,
                description: item
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                enabled: true,
                input_schema: item.get("inputSchema").cloned().unwrap_or(json!({})),
                permissions: categories,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerDefinition;

    fn instance_with_tools(tools: Vec<ToolDescriptor>) -> Arc<ServerInstance> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let instance = ServerInstance::new(
            ServerDefinition {
                name: "test".into(),
                command: "/bin/true".into(),
                port: 9100,
                ..Default::default()
            },
            tx,
        );
        *instance.tools.write() = tools;
        instance
    }

    fn tool(name: &str, categories: &[PermissionCategory]) -> ToolDescriptor {
        ToolDescriptor {
            name: name.into(),
            description: String::new(),
            enabled: true,
            input_schema: json!({}),
            permissions: categories.to_vec(),
        }
    }

    #[test]
    fn parses_tools_with_declared_categories() {
        let result = json!({
            "tools": [
                {
                    "name": "fetch_page",
                    "description": "Fetch a page",
                    "inputSchema": {"type": "object"},
                    "permissions": {"categories": ["READ_REMOTE"]}
                },
                {
                    "name": "delete_page",
                    "permissions": {"categories": ["WRITE_REMOTE", "BOGUS"]}
                }
            ]
        });
        let tools = parse_tool_descriptors(&result);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].permissions, vec![PermissionCategory::ReadRemote]);
        assert!(tools[0].enabled);
        assert_eq!(tools[1].permissions, vec![PermissionCategory::WriteRemote]);
        assert_eq!(tools[1].description, "");
    }

    #[test]
    fn unknown_tool_passes_permission_check() {
        let instance = instance_with_tools(vec![]);
        assert!(instance
            .check_tool_permission("whatever", &PermissionSet::new())
            .is_ok());
    }

    #[test]
    fn known_tool_requires_every_category() {
        let instance = instance_with_tools(vec![tool(
            "sync",
            &[PermissionCategory::ReadRemote, PermissionCategory::WriteRemote],
        )]);
        let global = PermissionSet::new();

        assert_eq!(
            instance.check_tool_permission("sync", &global),
            Err(PermissionCategory::WriteRemote)
        );

        instance.set_permission(PermissionCategory::WriteRemote, Some(true));
        assert!(instance.check_tool_permission("sync", &global).is_ok());
    }

    #[test]
    fn output_ring_is_bounded() {
        let instance = instance_with_tools(vec![]);
        for i in 0..(MAX_OUTPUT_LINES + 25) {
            instance.push_output(&format!("line {i}"));
        }
        let recent = instance.recent_output(MAX_OUTPUT_LINES + 100);
        assert_eq!(recent.len(), MAX_OUTPUT_LINES);
        assert_eq!(recent[0], "line 25");
        assert_eq!(recent.last().unwrap(), &format!("line {}", MAX_OUTPUT_LINES + 24));
    }

    #[test]
    fn toggling_unknown_tool_is_a_noop() {
        let instance = instance_with_tools(vec![tool("a", &[])]);
        instance.set_tool_enabled("missing", false);
        assert!(instance.is_tool_enabled("a"));
        instance.set_tool_enabled("a", false);
        assert!(!instance.is_tool_enabled("a"));
        // Unknown tools are enabled by default.
        assert!(instance.is_tool_enabled("missing"));
    }
}
