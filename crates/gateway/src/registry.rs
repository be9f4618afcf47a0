//! The registry: configured servers, permission state, client bookkeeping.
//!
//! Owns one [`ServerInstance`] per server definition and the persisted
//! configuration document. Supervisor events and permission changes fan
//! out over a broadcast channel; the gateway subscribes to tear down
//! sessions affected by permission changes.

use crate::config::{GatewayConfig, PermissionsSection, RegisteredClient, ServerDefinition};
use crate::error::{GatewayError, Result};
use crate::permissions::{PermissionCategory, PermissionSet};
use crate::supervisor::{InstanceEvent, InstanceStatus, ServerInstance};
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    ServerAdded(String),
    ServerRemoved(String),
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
    ServerError {
        server: String,
        message: String,
    },
    ToolsChanged(String),
    ServerPermissionsChanged(String),
    GlobalPermissionsChanged,
}

pub struct Registry {
    config_path: PathBuf,
    servers: RwLock<BTreeMap<String, Arc<ServerInstance>>>,
    global_defaults: RwLock<PermissionSet>,
    registered_clients: RwLock<BTreeMap<String, RegisteredClient>>,
    client_permissions: RwLock<BTreeMap<String, PermissionSet>>,
    events: broadcast::Sender<RegistryEvent>,
    instance_tx: mpsc::UnboundedSender<InstanceEvent>,
}

impl Registry {
    /// Build the registry from a loaded configuration document and spawn
    /// the event pump that re-broadcasts supervisor events.
    pub fn new(config_path: PathBuf, config: GatewayConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (instance_tx, instance_rx) = mpsc::unbounded_channel();

        let mut servers = BTreeMap::new();
        for definition in config.servers {
            let name = definition.name.clone();
            if name.is_empty() {
                tracing::warn!("skipping unnamed server definition");
                continue;
            }
            servers.insert(name, ServerInstance::new(definition, instance_tx.clone()));
        }
        tracing::info!(count = servers.len(), "registry loaded");

        let registry = Arc::new(Self {
            config_path,
            servers: RwLock::new(servers),
            global_defaults: RwLock::new(config.permissions.global_defaults),
            registered_clients: RwLock::new(config.registered_clients),
            client_permissions: RwLock::new(config.client_permissions),
            events,
            instance_tx,
        });

        registry.spawn_event_pump(instance_rx);
        registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn spawn_event_pump(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<InstanceEvent>) {
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mapped = match event {
                    InstanceEvent::StatusChanged { server, status } => {
                        RegistryEvent::StatusChanged { server, status }
                    }
                    InstanceEvent::Output { server, line } => {
                        RegistryEvent::Output { server, line }
                    }
                    InstanceEvent::ErrorOutput { server, line } => {
                        RegistryEvent::ErrorOutput { server, line }
                    }
                    InstanceEvent::ToolsChanged { server } => {
                        RegistryEvent::ToolsChanged(server)
                    }
                    InstanceEvent::Error { server, message } => {
                        RegistryEvent::ServerError { server, message }
                    }
                };
                // Send fails only when nobody subscribes, which is fine.
                let _ = events.send(mapped);
            }
        });
    }

    // ------------------------------------------------------------------
    // Server management
    // ------------------------------------------------------------------

    pub fn server(&self, name: &str) -> Option<Arc<ServerInstance>> {
        self.servers.read().get(name).cloned()
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.read().keys().cloned().collect()
    }

    fn all_servers(&self) -> Vec<Arc<ServerInstance>> {
        self.servers.read().values().cloned().collect()
    }

    pub fn add_server(&self, definition: ServerDefinition) -> Result<()> {
        definition.validate()?;
        let name = definition.name.clone();
        {
            let mut servers = self.servers.write();
            if servers.contains_key(&name) {
                return Err(GatewayError::Config(format!(
                    "server '{name}' already exists"
                )));
            }
            servers.insert(
                name.clone(),
                ServerInstance::new(definition, self.instance_tx.clone()),
            );
        }
        self.save()?;
        tracing::info!(server = %name, "server added");
        let _ = self.events.send(RegistryEvent::ServerAdded(name));
        Ok(())
    }

    pub async fn remove_server(&self, name: &str) -> Result<()> {
        let Some(instance) = self.servers.write().remove(name) else {
            return Err(GatewayError::Config(format!("unknown server '{name}'")));
        };
        instance.stop().await;
        self.save()?;
        tracing::info!(server = %name, "server removed");
        let _ = self
            .events
            .send(RegistryEvent::ServerRemoved(name.to_string()));
        Ok(())
    }

    pub async fn start_server(&self, name: &str) -> Result<()> {
        match self.server(name) {
            Some(instance) => instance.start().await,
            None => Err(GatewayError::Config(format!("unknown server '{name}'"))),
        }
    }

    pub async fn stop_server(&self, name: &str) -> Result<()> {
        match self.server(name) {
            Some(instance) => {
                instance.stop().await;
                Ok(())
            }
            None => Err(GatewayError::Config(format!("unknown server '{name}'"))),
        }
    }

    pub async fn restart_server(&self, name: &str) -> Result<()> {
        match self.server(name) {
            Some(instance) => instance.restart().await,
            None => Err(GatewayError::Config(format!("unknown server '{name}'"))),
        }
    }

    pub async fn start_all(&self) {
        for instance in self.all_servers() {
            if let Err(e) = instance.start().await {
                tracing::warn!(server = %instance.name(), error = %e, "failed to start server");
            }
        }
    }

    pub async fn stop_all(&self) {
        for instance in self.all_servers() {
            instance.stop().await;
        }
    }

    pub async fn start_autostart_servers(&self) {
        for instance in self.all_servers() {
            if !instance.definition().auto_start {
                continue;
            }
            if let Err(e) = instance.start().await {
                tracing::warn!(server = %instance.name(), error = %e, "failed to auto-start server");
            }
        }
    }

    pub fn running_count(&self) -> usize {
        self.all_servers()
            .iter()
            .filter(|i| i.status() == InstanceStatus::Running)
            .count()
    }

    pub fn stopped_count(&self) -> usize {
        self.servers.read().len() - self.running_count()
    }

    /// Status summaries in the shape the wire protocol reports.
    pub fn statuses(&self) -> Vec<Value> {
        self.all_servers()
            .iter()
            .map(|instance| {
                let definition = instance.definition();
                json!({
                    "name": definition.name,
                    "type": definition.server_type,
                    "port": definition.port,
                    "status": instance.status().to_string(),
                    "isRunning": instance.status() == InstanceStatus::Running,
                    "autoStart": definition.auto_start,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Permissions
    // ------------------------------------------------------------------

    pub fn global_defaults(&self) -> PermissionSet {
        self.global_defaults.read().clone()
    }

    pub fn global_permission(&self, category: PermissionCategory) -> bool {
        crate::permissions::resolve(category, &[&self.global_defaults()])
    }

    pub fn set_global_permission(
        &self,
        category: PermissionCategory,
        value: bool,
    ) -> Result<()> {
        self.global_defaults.write().set(category, Some(value));
        self.save()?;
        tracing::info!(category = %category, value, "global permission changed");
        let _ = self.events.send(RegistryEvent::GlobalPermissionsChanged);
        Ok(())
    }

    /// Set or clear (`None`) a per-server category override.
    pub fn set_server_permission(
        &self,
        name: &str,
        category: PermissionCategory,
        value: Option<bool>,
    ) -> Result<()> {
        let Some(instance) = self.server(name) else {
            return Err(GatewayError::Config(format!("unknown server '{name}'")));
        };
        instance.set_permission(category, value);
        self.save()?;
        tracing::info!(server = %name, category = %category, ?value, "server permission changed");
        let _ = self
            .events
            .send(RegistryEvent::ServerPermissionsChanged(name.to_string()));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Client bookkeeping
    // ------------------------------------------------------------------

    fn client_key(user_id: &str, client_app: &str) -> String {
        format!("{user_id}|{client_app}")
    }

    /// Record a (userId, clientApp) pairing; re-registration refreshes
    /// `lastSeen` only.
    pub fn register_client(&self, user_id: &str, client_app: &str) -> Result<()> {
        let key = Self::client_key(user_id, client_app);
        let now = Utc::now();
        {
            let mut clients = self.registered_clients.write();
            clients
                .entry(key.clone())
                .and_modify(|c| c.last_seen = now)
                .or_insert_with(|| RegisteredClient {
                    user_id: user_id.to_string(),
                    client_app: client_app.to_string(),
                    first_seen: now,
                    last_seen: now,
                });
        }
        self.save()?;
        tracing::debug!(client = %key, "client registered");
        Ok(())
    }

    pub fn registered_clients(&self) -> BTreeMap<String, RegisteredClient> {
        self.registered_clients.read().clone()
    }

    /// Effective permission for a (user, app) pairing plus whether it was
    /// an explicit per-client override or the inherited global value.
    pub fn client_permission(
        &self,
        user_id: &str,
        client_app: &str,
        category: PermissionCategory,
    ) -> (bool, bool) {
        let key = Self::client_key(user_id, client_app);
        if let Some(set) = self.client_permissions.read().get(&key) {
            if let Some(value) = set.get(category) {
                return (value, true);
            }
        }
        (self.global_permission(category), false)
    }

    pub fn set_client_permission(
        &self,
        user_id: &str,
        client_app: &str,
        category: PermissionCategory,
        value: Option<bool>,
    ) -> Result<()> {
        let key = Self::client_key(user_id, client_app);
        {
            let mut all = self.client_permissions.write();
            let set = all.entry(key.clone()).or_default();
            set.set(category, value);
            if set.is_empty() {
                all.remove(&key);
            }
        }
        self.save()?;
        tracing::info!(client = %key, category = %category, ?value, "client permission changed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Rewrite the configuration document from current state. Only
    /// explicit permission overrides are ever written out.
    pub fn save(&self) -> Result<()> {
        let config = GatewayConfig {
            servers: self
                .all_servers()
                .iter()
                .map(|instance| instance.definition())
                .collect(),
            permissions: PermissionsSection {
                global_defaults: self.global_defaults(),
            },
            registered_clients: self.registered_clients.read().clone(),
            client_permissions: self.client_permissions.read().clone(),
        };
        config.save(&self.config_path)
    }
}
