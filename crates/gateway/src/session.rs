//! Per-client sessions, each owning a dedicated tool-server subprocess.
//!
//! A session spawns its subprocess with credentials layered into the
//! environment, immediately sends the MCP `initialize` request (reserved
//! id 999), and queues every other outgoing request until the matching
//! response arrives. Once initialized it sends `notifications/initialized`,
//! flushes the queue in FIFO order, and from then on forwards traffic in
//! both directions. Sessions never restart their subprocess; an unexpected
//! exit just deactivates the session and notifies the gateway.

use crate::config::ServerDefinition;
use crate::error::{GatewayError, Result};
use crate::proc;
use crate::protocol;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A message from the subprocess to forward to the owning client.
    Response { session_id: String, message: Value },
    Error { session_id: String, message: String },
    Exited { session_id: String },
}

pub struct Session {
    id: String,
    definition: ServerDefinition,
    /// The server name the client asked for; also drives env compatibility
    /// quirks below.
    server_type: String,
    user_id: Option<String>,
    client_app: String,
    /// Tool allowlist loaded from the keystore at creation; empty means no
    /// user-specific restriction.
    allowed_tools: Vec<String>,
    created: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
    request_count: AtomicU64,
    initialized: AtomicBool,
    active: AtomicBool,
    closing: AtomicBool,
    pending: Mutex<Vec<Value>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pid: RwLock<Option<i32>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Session {
    pub fn new(
        id: String,
        definition: ServerDefinition,
        user_id: Option<String>,
        client_app: String,
        allowed_tools: Vec<String>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let server_type = definition.name.clone();
        let now = Utc::now();
        Arc::new(Self {
            id,
            definition,
            server_type,
            user_id,
            client_app,
            allowed_tools,
            created: now,
            last_activity: RwLock::new(now),
            request_count: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            active: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            stdin: tokio::sync::Mutex::new(None),
            pid: RwLock::new(None),
            events,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn server_type(&self) -> &str {
        &self.server_type
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn client_app(&self) -> &str {
        &self.client_app
    }

    pub fn allowed_tools(&self) -> &[String] {
        &self.allowed_tools
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read()
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Spawn the subprocess and begin the protocol handshake.
    pub async fn start(self: &Arc<Self>, credentials: &BTreeMap<String, String>) -> Result<()> {
        if self.active.load(Ordering::SeqCst) {
            return Err(GatewayError::Runtime("session already started".into()));
        }
        if self.definition.command.trim().is_empty() {
            return Err(GatewayError::Startup(
                "no command specified in server config".into(),
            ));
        }

        let env = build_environment(&self.server_type, &self.definition.env, credentials);

        let mut command = Command::new(&self.definition.command);
        command
            .args(&self.definition.arguments)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.definition.working_dir.as_deref().filter(|d| !d.is_empty()) {
            command.current_dir(dir);
        }

        tracing::info!(
            session = %self.id,
            server = %self.server_type,
            command = %self.definition.command,
            "starting session server"
        );

        let mut child = command
            .spawn()
            .map_err(|e| GatewayError::Startup(format!("failed to start server process: {e}")))?;

        *self.pid.write() = child.id().map(|p| p as i32);
        *self.stdin.lock().await = child.stdin.take();
        self.active.store(true, Ordering::SeqCst);

        if let Some(stdout) = child.stdout.take() {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    session.handle_line(line.trim()).await;
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        tracing::warn!(session = %session.id, "stderr: {}", line.trim());
                    }
                }
            });
        }

        {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                let status = child.wait().await.ok();
                session.handle_exit(status);
            });
        }

        // Handshake goes out immediately; everything else queues behind it.
        self.write_line(&protocol::initialize_request(protocol::SESSION_INIT_ID))
            .await
    }

    /// Stop the subprocess: SIGTERM, bounded wait, SIGKILL.
    pub async fn stop(&self) {
        self.closing.store(true, Ordering::SeqCst);
        *self.stdin.lock().await = None;
        let pid = *self.pid.read();
        if let Some(pid) = pid {
            tracing::debug!(session = %self.id, pid, "stopping session server");
            proc::terminate_and_reap(pid).await;
        }
        self.active.store(false, Ordering::SeqCst);
    }

    /// Send a request toward the subprocess, queueing it while the
    /// handshake is still in flight. Queued requests keep arrival order.
    pub async fn send(&self, request: Value) -> Result<()> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(GatewayError::Runtime(format!(
                "session {} server is not running",
                self.id
            )));
        }

        if !protocol::has_id(&request, protocol::SESSION_INIT_ID) {
            // Re-check under the queue lock: the flag flips inside
            // flush_pending while it holds this lock, so a request either
            // lands in the backlog or runs strictly after it drained.
            let mut pending = self.pending.lock();
            if !self.initialized.load(Ordering::SeqCst) {
                tracing::debug!(
                    session = %self.id,
                    method = request.get("method").and_then(|v| v.as_str()).unwrap_or(""),
                    "queueing request until initialized"
                );
                pending.push(request);
                return Ok(());
            }
        }

        self.forward(request).await
    }

    async fn forward(&self, request: Value) -> Result<()> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.write() = Utc::now();
        self.write_line(&request).await
    }

    async fn write_line(&self, msg: &Value) -> Result<()> {
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

    async fn handle_line(self: &Arc<Self>, line: &str) {
        if line.is_empty() {
            return;
        }
        let msg: Value = match serde_json::from_str(line) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "unparseable server output");
                return;
            }
        };

        // The initialize response completes the handshake and is withheld
        // from the client; it never asked for it.
        if !self.initialized.load(Ordering::SeqCst)
            && protocol::has_id(&msg, protocol::SESSION_INIT_ID)
        {
            tracing::debug!(session = %self.id, "initialize response received");
            let notification = protocol::notification("notifications/initialized", Value::Null);
            if let Err(e) = self.write_line(&notification).await {
                tracing::warn!(session = %self.id, error = %e, "failed to send initialized notification");
            }
            self.flush_pending().await;
            return;
        }

        let _ = self.events.send(SessionEvent::Response {
            session_id: self.id.clone(),
            message: msg,
        });
    }

    /// Drain the backlog in FIFO order, then mark the session initialized.
    /// The flag flips while the queue lock is held and the queue is empty,
    /// so no request can slip in behind the drain unflushed.
    async fn flush_pending(&self) {
        loop {
            let queued: Vec<Value> = {
                let mut pending = self.pending.lock();
                if pending.is_empty() {
                    self.initialized.store(true, Ordering::SeqCst);
                    return;
                }
                std::mem::take(&mut *pending)
            };
            tracing::debug!(session = %self.id, count = queued.len(), "flushing queued requests");
            for request in queued {
                if let Err(e) = self.forward(request).await {
                    tracing::warn!(session = %self.id, error = %e, "failed to flush queued request");
                }
            }
        }
    }

    fn handle_exit(&self, status: Option<std::process::ExitStatus>) {
        *self.pid.write() = None;
        self.active.store(false, Ordering::SeqCst);

        if self.closing.load(Ordering::SeqCst) {
            return;
        }

        tracing::warn!(session = %self.id, exit = ?status.and_then(|s| s.code()), "session server exited");
        if status.map_or(true, |s| s.code().is_none()) {
            let _ = self.events.send(SessionEvent::Error {
                session_id: self.id.clone(),
                message: "server process crashed".into(),
            });
        }
        let _ = self.events.send(SessionEvent::Exited {
            session_id: self.id.clone(),
        });
    }
}

/// Layer the subprocess environment, lowest to highest precedence: the
/// gateway's own environment, the server definition's `env`, then the
/// session credentials (one variable per credential key, empty values
/// skipped). Service-specific compatibility quirks run last.
fn build_environment(
    server_type: &str,
    base_env: &BTreeMap<String, String>,
    credentials: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let env = std::env::vars().collect();
    layer_environment(env, server_type, base_env, credentials)
}

fn layer_environment(
    mut env: BTreeMap<String, String>,
    server_type: &str,
    base_env: &BTreeMap<String, String>,
    credentials: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    for (key, value) in base_env {
        env.insert(key.clone(), value.clone());
    }
    for (key, value) in credentials {
        if !value.is_empty() {
            env.insert(key.clone(), value.clone());
        }
    }

    // The Microsoft Azure DevOps server reads ADO_MCP_AUTH_TOKEN while
    // clients historically supply AZDO_PAT; mirror one to the other.
    if server_type == "Azure DevOps" {
        apply_azdo_remap(&mut env);
    }

    // Development convenience only: with no credentials at all, inherit a
    // small per-service whitelist from the gateway's own environment. Never
    // overrides anything already present.
    if credentials.is_empty() {
        let whitelist: &[&str] = match server_type {
            "ChatNS" => &["CHAT_APIM", "OCP_APIM_SUBSCRIPTION_KEY", "CHAT_BEARER"],
            "Azure DevOps" => &["AZDO_PAT", "AZDO_ORG", "ADO_MCP_AUTH_TOKEN"],
            "Atlassian" => &[
                "ATLASSIAN_EMAIL",
                "ATLASSIAN_API_TOKEN",
                "CONFLUENCE_URL",
                "JIRA_URL",
            ],
            "TeamCentraal" => &[
                "TEAMCENTRAAL_URL",
                "TEAMCENTRAAL_USERNAME",
                "TEAMCENTRAAL_PASSWORD",
            ],
            _ => &[],
        };
        for key in whitelist {
            if env.contains_key(*key) {
                continue;
            }
            if let Ok(value) = std::env::var(key) {
                if !value.is_empty() {
                    env.insert((*key).to_string(), value);
                }
            }
        }
        if server_type == "Azure DevOps" {
            apply_azdo_remap(&mut env);
        }
    }

    env
}

fn apply_azdo_remap(env: &mut BTreeMap<String, String>) {
    if env.contains_key("AZDO_PAT") && !env.contains_key("ADO_MCP_AUTH_TOKEN") {
        let pat = env["AZDO_PAT"].clone();
        env.insert("ADO_MCP_AUTH_TOKEN".to_string(), pat);
    }
}
