//! The TCP front end.
//!
//! Accepts loopback connections speaking newline-delimited JSON-RPC,
//! creates and destroys sessions, and routes tool calls through the
//! authorization chain: disabled tool, user block-all marker, user
//! allowlist, then category permissions. A session belongs to exactly one
//! connection; requests for it from any other socket are rejected.

use crate::error::Result;
use crate::protocol::{self, BLOCK_ALL_MARKER};
use crate::registry::{Registry, RegistryEvent};
use crate::session::{Session, SessionEvent};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use toolgate_keystore::Keystore;
use uuid::Uuid;

struct SessionEntry {
    session: Arc<Session>,
    owner: u64,
}

pub struct Gateway {
    registry: Arc<Registry>,
    keystore: Arc<Keystore>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    connections: RwLock<HashMap<u64, mpsc::UnboundedSender<String>>>,
    next_connection: AtomicU64,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    session_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
}

impl Gateway {
    pub fn new(registry: Arc<Registry>, keystore: Arc<Keystore>) -> Arc<Self> {
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            registry,
            keystore,
            sessions: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(0),
            session_tx,
            session_rx: Mutex::new(Some(session_rx)),
        })
    }

    /// Run the accept loop. Also starts the pumps that route subprocess
    /// responses back to owning clients and react to permission changes.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        self.spawn_session_event_pump();
        self.spawn_registry_event_pump();

        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "gateway listening");
        }

        loop {
            let (stream, _) = listener.accept().await?;
            let conn_id = self.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
            let gateway = Arc::clone(&self);
            tokio::spawn(gateway.handle_connection(stream, conn_id));
        }
    }

    /// Destroy every session; used on process shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        for id in ids {
            self.destroy_session_by_id(&id).await;
        }
    }

    // ------------------------------------------------------------------
    // Connection handling
    // ------------------------------------------------------------------

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, conn_id: u64) {
        let addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        tracing::info!(client = %addr, conn = conn_id, "client connected");

        let (reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.connections.write().insert(conn_id, tx);

        let writer_addr = addr.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                tracing::debug!(target: "traffic", client = %writer_addr, dir = "OUT", %line);
                if writer.write_all(line.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                {
                    break;
                }
                let _ = writer.flush().await;
            }
        });

        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            tracing::debug!(target: "traffic", client = %addr, dir = "IN", %line);
            match serde_json::from_str::<Value>(line) {
                Ok(msg) => self.dispatch(conn_id, msg).await,
                Err(e) => {
                    tracing::warn!(client = %addr, error = %e, "json parse error");
                    self.respond(
                        conn_id,
                        protocol::error(Value::Null, protocol::PARSE_ERROR, "Parse error"),
                    );
                }
            }
        }

        tracing::info!(client = %addr, conn = conn_id, "client disconnected");
        self.cleanup_connection(conn_id).await;
        writer_task.abort();
    }

    async fn cleanup_connection(&self, conn_id: u64) {
        self.connections.write().remove(&conn_id);
        let owned: Vec<String> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, entry)| entry.owner == conn_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in owned {
            tracing::info!(session = %id, "destroying session for closed connection");
            self.destroy_session_by_id(&id).await;
        }
    }

    fn respond(&self, conn_id: u64, msg: Value) {
        let tx = self.connections.read().get(&conn_id).cloned();
        let Some(tx) = tx else { return };
        match serde_json::to_string(&msg) {
            Ok(line) => {
                let _ = tx.send(line);
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize response"),
        }
    }

    // ------------------------------------------------------------------
    // Request dispatch
    // ------------------------------------------------------------------

    async fn dispatch(&self, conn_id: u64, msg: Value) {
        let id = msg.get("id").cloned().unwrap_or(Value::Null);
        let Some(method) = msg.get("method").and_then(Value::as_str) else {
            self.respond(
                conn_id,
                protocol::error(id, protocol::INVALID_REQUEST, "Invalid request"),
            );
            return;
        };
        let params = msg.get("params").cloned().unwrap_or_else(|| json!({}));

        match method {
            "mcp-manager/create-session" => self.create_session(conn_id, id, &params).await,
            "mcp-manager/destroy-session" => self.destroy_session(conn_id, id, &params).await,
            "mcp-manager/list-sessions" => self.list_sessions(conn_id, id),
            "mcp-manager/list-servers" => self.list_servers(conn_id, id),
            "tools/list" => self.tools_list(conn_id, id, &params).await,
            "tools/call" => self.tools_call(conn_id, id, &params).await,
            other => self.respond(
                conn_id,
                protocol::error(
                    id,
                    protocol::METHOD_NOT_FOUND,
                    format!("Method not found: {other}"),
                ),
            ),
        }
    }

    async fn create_session(&self, conn_id: u64, id: Value, params: &Value) {
        let server_type = params
            .get("serverType")
            .and_then(Value::as_str)
            .unwrap_or("");
        if server_type.is_empty() {
            self.respond(
                conn_id,
                protocol::error(
                    id,
                    protocol::INVALID_PARAMS,
                    "Missing serverType parameter",
                ),
            );
            return;
        }
        let user_id = params.get("userId").and_then(Value::as_str).unwrap_or("");
        let client_app = params
            .get("clientApp")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("Unknown");

        let credentials: BTreeMap<String, String> = if !user_id.is_empty() {
            match self.credentials_for_user(user_id, server_type) {
                Ok(Some(map)) => map,
                Ok(None) => {
                    self.respond(
                        conn_id,
                        protocol::error(
                            id,
                            protocol::CREDENTIALS_NOT_FOUND,
                            format!(
                                "No credentials found for user {user_id}, system {server_type}"
                            ),
                        ),
                    );
                    return;
                }
                Err(e) => {
                    self.respond(
                        conn_id,
                        protocol::error(
                            id,
                            protocol::INTERNAL_ERROR,
                            format!("Credential lookup failed: {e}"),
                        ),
                    );
                    return;
                }
            }
        } else if let Some(obj) = params
            .get("credentials")
            .and_then(Value::as_object)
            .filter(|o| !o.is_empty())
        {
            tracing::warn!(
                server = server_type,
                "session created using legacy credentials (no userId)"
            );
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        } else {
            self.respond(
                conn_id,
                protocol::error(
                    id,
                    protocol::INVALID_PARAMS,
                    "Missing authentication: provide either 'userId' or 'credentials' parameter",
                ),
            );
            return;
        };

        let Some(instance) = self.registry.server(server_type) else {
            self.respond(
                conn_id,
                protocol::error(
                    id,
                    protocol::INVALID_PARAMS,
                    format!("Unknown server type: {server_type}"),
                ),
            );
            return;
        };
        let definition = instance.definition();

        if !user_id.is_empty() {
            if let Err(e) = self.registry.register_client(user_id, client_app) {
                tracing::warn!(error = %e, "failed to persist client registration");
            }
        }

        let allowed_tools = if user_id.is_empty() {
            Vec::new()
        } else {
            match self
                .keystore
                .get_user_permissions(user_id, &server_type.to_lowercase())
            {
                Ok(tools) => tools,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load user permissions");
                    Vec::new()
                }
            }
        };

        let session_id = Uuid::new_v4().to_string();
        let session = Session::new(
            session_id.clone(),
            definition,
            (!user_id.is_empty()).then(|| user_id.to_string()),
            client_app.to_string(),
            allowed_tools,
            self.session_tx.clone(),
        );

        if let Err(e) = session.start(&credentials).await {
            self.respond(
                conn_id,
                protocol::error(
                    id,
                    protocol::INTERNAL_ERROR,
                    format!("Failed to start server process: {e}"),
                ),
            );
            return;
        }

        let created = session.created();
        self.sessions.write().insert(
            session_id.clone(),
            SessionEntry {
                session,
                owner: conn_id,
            },
        );
        tracing::info!(session = %session_id, server = server_type, user = user_id, "session created");

        self.respond(
            conn_id,
            protocol::success(
                id,
                json!({
                    "sessionId": session_id,
                    "serverType": server_type,
                    "created": created.to_rfc3339(),
                }),
            ),
        );
    }

    async fn destroy_session(&self, conn_id: u64, id: Value, params: &Value) {
        let session_id = match self.owned_session(conn_id, params) {
            Ok(session) => session.id().to_string(),
            Err((code, message)) => {
                self.respond(conn_id, protocol::error(id, code, message));
                return;
            }
        };

        self.destroy_session_by_id(&session_id).await;
        self.respond(
            conn_id,
            protocol::success(
                id,
                json!({"sessionId": session_id, "destroyed": true}),
            ),
        );
    }

    fn list_sessions(&self, conn_id: u64, id: Value) {
        let sessions: Vec<Value> = self
            .sessions
            .read()
            .values()
            .filter(|entry| entry.owner == conn_id)
            .map(|entry| {
                let s = &entry.session;
                json!({
                    "sessionId": s.id(),
                    "serverType": s.server_type(),
                    "created": s.created().to_rfc3339(),
                    "lastActivity": s.last_activity().to_rfc3339(),
                    "requestCount": s.request_count(),
                    "active": s.is_active(),
                })
            })
            .collect();
        let count = sessions.len();
        self.respond(
            conn_id,
            protocol::success(id, json!({"sessions": sessions, "count": count})),
        );
    }

    fn list_servers(&self, conn_id: u64, id: Value) {
        let servers = self.registry.statuses();
        let count = servers.len();
        self.respond(
            conn_id,
            protocol::success(id, json!({"servers": servers, "count": count})),
        );
    }

    async fn tools_list(&self, conn_id: u64, id: Value, params: &Value) {
        let session = match self.owned_session(conn_id, params) {
            Ok(session) => session,
            Err((code, message)) => {
                self.respond(conn_id, protocol::error(id, code, message));
                return;
            }
        };

        let request = protocol::request(id.clone(), "tools/list", json!({}));
        if let Err(e) = session.send(request).await {
            self.respond(
                conn_id,
                protocol::error(id, protocol::INTERNAL_ERROR, e.to_string()),
            );
        }
    }

    /// Authorization is evaluated in a fixed order; the first matching rule
    /// decides. Known-but-unauthorized tools fail closed; tools the server
    /// never declared fail open.
    async fn tools_call(&self, conn_id: u64, id: Value, params: &Value) {
        let session = match self.owned_session(conn_id, params) {
            Ok(session) => session,
            Err((code, message)) => {
                self.respond(conn_id, protocol::error(id, code, message));
                return;
            }
        };
        let tool = params.get("name").and_then(Value::as_str).unwrap_or("");
        let server_type = session.server_type().to_string();
        let instance = self.registry.server(&server_type);

        // 1. Tool disabled at the server level beats everything.
        if let Some(instance) = &instance {
            if !instance.is_tool_enabled(tool) {
                tracing::warn!(tool, server = %server_type, "tool call blocked: disabled");
                self.respond(
                    conn_id,
                    protocol::error(
                        id,
                        protocol::TOOL_DISABLED,
                        format!("Tool '{tool}' is disabled for server '{server_type}'"),
                    ),
                );
                return;
            }
        }

        let allowlist = session.allowed_tools();
        if !allowlist.is_empty() {
            // 2. A block-all marker denies every tool for this user.
            if allowlist.iter().any(|t| t == BLOCK_ALL_MARKER) {
                let user = session.user_id().unwrap_or("");
                tracing::warn!(tool, user, "tool call blocked: user block-all");
                self.respond(
                    conn_id,
                    protocol::error(
                        id,
                        protocol::USER_BLOCKED,
                        format!("Tool '{tool}' blocked: user '{user}' has all permissions blocked"),
                    ),
                );
                return;
            }
            // 3. An allowlist that exists must contain the tool.
            if !allowlist.iter().any(|t| t == tool) {
                let user = session.user_id().unwrap_or("");
                tracing::warn!(tool, user, "tool call blocked: not in user allowlist");
                self.respond(
                    conn_id,
                    protocol::error(
                        id,
                        protocol::ALLOWLIST_DENIED,
                        format!("Tool '{tool}' blocked: user '{user}' does not have permission"),
                    ),
                );
                return;
            }
            // Allowlisted tools bypass the category check.
        } else if let Some(instance) = &instance {
            // 4. No user allowlist: fall back to category permissions.
            if let Err(category) =
                instance.check_tool_permission(tool, &self.registry.global_defaults())
            {
                tracing::warn!(tool, server = %server_type, %category, "tool call blocked: category denied");
                self.respond(
                    conn_id,
                    protocol::error(
                        id,
                        protocol::CATEGORY_DENIED,
                        format!(
                            "Tool '{tool}' blocked: insufficient permissions for server '{server_type}'"
                        ),
                    ),
                );
                return;
            }
        }

        // 5. Forward with the client's own id; the subprocess response
        // flows back through the session event pump.
        let request = protocol::request(
            id.clone(),
            "tools/call",
            json!({
                "name": params.get("name").cloned().unwrap_or(Value::Null),
                "arguments": params.get("arguments").cloned().unwrap_or_else(|| json!({})),
            }),
        );
        if let Err(e) = session.send(request).await {
            self.respond(
                conn_id,
                protocol::error(id, protocol::INTERNAL_ERROR, e.to_string()),
            );
        }
    }

    fn owned_session(
        &self,
        conn_id: u64,
        params: &Value,
    ) -> std::result::Result<Arc<Session>, (i64, String)> {
        let session_id = params
            .get("sessionId")
            .and_then(Value::as_str)
            .unwrap_or("");
        if session_id.is_empty() {
            return Err((protocol::INVALID_PARAMS, "Missing sessionId parameter".into()));
        }
        let sessions = self.sessions.read();
        let Some(entry) = sessions.get(session_id) else {
            return Err((
                protocol::INVALID_PARAMS,
                format!("Session not found: {session_id}"),
            ));
        };
        if entry.owner != conn_id {
            return Err((
                protocol::INTERNAL_ERROR,
                "Session owned by different client".into(),
            ));
        }
        Ok(Arc::clone(&entry.session))
    }

    // ------------------------------------------------------------------
    // Session lifecycle plumbing
    // ------------------------------------------------------------------

    async fn destroy_session_by_id(&self, session_id: &str) {
        let Some(entry) = self.sessions.write().remove(session_id) else {
            return;
        };
        tracing::info!(session = %session_id, "session destroyed");
        let session = entry.session;
        tokio::spawn(async move { session.stop().await });
    }

    fn spawn_session_event_pump(self: &Arc<Self>) {
        let Some(mut rx) = self.session_rx.lock().take() else {
            return;
        };
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    SessionEvent::Response { session_id, message } => {
                        let owner = gateway
                            .sessions
                            .read()
                            .get(&session_id)
                            .map(|e| e.owner);
                        if let Some(owner) = owner {
                            gateway.respond(owner, message);
                        }
                    }
                    SessionEvent::Error { session_id, message } => {
                        gateway.notify_session_error(&session_id, &message);
                    }
                    SessionEvent::Exited { session_id } => {
                        gateway.destroy_session_by_id(&session_id).await;
                    }
                }
            }
        });
    }

    fn spawn_registry_event_pump(self: &Arc<Self>) {
        let gateway = Arc::clone(self);
        let mut rx = self.registry.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(RegistryEvent::GlobalPermissionsChanged) => {
                        tracing::warn!("global permissions changed, destroying all sessions");
                        gateway.teardown_sessions(None).await;
                    }
                    Ok(RegistryEvent::ServerPermissionsChanged(server)) => {
                        tracing::warn!(server = %server, "server permissions changed, destroying its sessions");
                        gateway.teardown_sessions(Some(&server)).await;
                    }
                    Ok(RegistryEvent::ServerRemoved(server)) => {
                        gateway.teardown_sessions(Some(&server)).await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "registry event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Destroy sessions for one server, or every session when `None`.
    async fn teardown_sessions(&self, server: Option<&str>) {
        let ids: Vec<String> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, entry)| {
                server.map_or(true, |s| entry.session.server_type() == s)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.destroy_session_by_id(id).await;
        }
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "sessions destroyed after permission change");
        }
    }

    fn notify_session_error(&self, session_id: &str, message: &str) {
        tracing::warn!(session = %session_id, message, "session server error");
        let owner = self.sessions.read().get(session_id).map(|e| e.owner);
        if let Some(owner) = owner {
            let notification = protocol::notification(
                "mcp-manager/session-error",
                json!({"sessionId": session_id, "error": message}),
            );
            self.respond(owner, notification);
        }
    }

    // ------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------

    /// Look up the stored credential for (user, server) and shape it into
    /// the credential map the session injects as environment variables.
    /// Each server family keeps its historical key name.
    fn credentials_for_user(
        &self,
        user_id: &str,
        server_type: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let service = server_type.to_lowercase();
        let key = if service == "azure" || server_type == "Azure DevOps" {
            "pat"
        } else if service == "confluence" || server_type == "Atlassian" {
            "token"
        } else if service == "teamcentraal" {
            "password"
        } else if service == "chatns" {
            "api_key"
        } else {
            "token"
        };

        let mut value = self.keystore.get_user_credential(user_id, &service, key)?;
        // Generic services historically stored under either name.
        if value.is_none() && key == "token" {
            value = self
                .keystore
                .get_user_credential(user_id, &service, "password")?;
        }

        Ok(value.map(|v| {
            let mut map = BTreeMap::new();
            map.insert(key.to_string(), v);
            map
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    fn gateway_with_store(dir: &tempfile::TempDir) -> Arc<Gateway> {
        let keystore = Arc::new(Keystore::open(dir.path()).unwrap());
        let registry = Registry::new(
            dir.path().join("config.json"),
            GatewayConfig::default(),
        );
        Gateway::new(registry, keystore)
    }

    #[tokio::test]
    async fn credential_key_mapping_per_server_family() {
        let dir = tempfile::TempDir::new().unwrap();
        let gateway = gateway_with_store(&dir);

        // The lookup service is the lowercased full server name.
        gateway
            .keystore
            .set_user_credential("u@x.com", "azure devops", "pat", "P")
            .unwrap();
        gateway
            .keystore
            .set_user_credential("u@x.com", "confluence", "token", "T")
            .unwrap();
        gateway
            .keystore
            .set_user_credential("u@x.com", "teamcentraal", "password", "W")
            .unwrap();

        let creds = gateway
            .credentials_for_user("u@x.com", "Azure DevOps")
            .unwrap()
            .unwrap();
        assert_eq!(creds["pat"], "P");

        let creds = gateway
            .credentials_for_user("u@x.com", "Confluence")
            .unwrap()
            .unwrap();
        assert_eq!(creds["token"], "T");

        let creds = gateway
            .credentials_for_user("u@x.com", "TeamCentraal")
            .unwrap()
            .unwrap();
        assert_eq!(creds["password"], "W");
    }

    #[tokio::test]
    async fn generic_lookup_falls_back_to_password() {
        let dir = tempfile::TempDir::new().unwrap();
        let gateway = gateway_with_store(&dir);

        gateway
            .keystore
            .set_user_credential("u@x.com", "wiki", "password", "only-pw")
            .unwrap();

        // Generic services try "token" first, then "password", but the map
        // key stays "token"-shaped per the generic mapping.
        let creds = gateway
            .credentials_for_user("u@x.com", "Wiki")
            .unwrap()
            .unwrap();
        assert_eq!(creds["token"], "only-pw");

        assert!(gateway
            .credentials_for_user("nobody", "Wiki")
            .unwrap()
            .is_none());
    }
}
