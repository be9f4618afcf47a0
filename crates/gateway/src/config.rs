//! Configuration: server definitions, permission defaults, client records.
//!
//! The whole document is owned by the [`Registry`](crate::registry::Registry)
//! and rewritten wholesale on every change. Only explicit permission
//! overrides are persisted; inherited values are recomputed at load time.

use crate::error::{GatewayError, Result};
use crate::permissions::PermissionSet;
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;

const MIN_SERVER_PORT: u16 = 1024;

#[derive(Parser, Debug, Clone)]
#[command(name = "toolgate", version, about = "Local MCP session gateway")]
pub struct CliArgs {
    /// Path to the server configuration file.
    #[arg(long, env = "TOOLGATE_CONFIG", default_value = "toolgate.json")]
    pub config: PathBuf,

    /// Directory holding the encrypted keystore and its master key.
    #[arg(long, env = "TOOLGATE_KEYSTORE_DIR", default_value = ".")]
    pub keystore_dir: PathBuf,

    /// TCP port to listen on (loopback only).
    #[arg(long, env = "TOOLGATE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Log level filter (overridden by TOOLGATE_LOG when set).
    #[arg(long, env = "TOOLGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// One configured tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerDefinition {
    pub name: String,
    /// Free-form type tag ("python", "node", "binary").
    #[serde(rename = "type")]
    pub server_type: String,
    pub command: String,
    pub arguments: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Informational; the subprocess binds this itself.
    pub port: u16,
    pub auto_start: bool,
    /// Milliseconds between supervisor health checks; 0 disables them.
    pub health_check_interval: u64,
    /// Explicit category overrides; absent categories inherit the global
    /// defaults.
    #[serde(skip_serializing_if = "PermissionSet::is_empty")]
    pub permissions: PermissionSet,
}

impl Default for ServerDefinition {
    fn default() -> Self {
        Self {
            name: String::new(),
            server_type: String::new(),
            command: String::new(),
            arguments: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            port: 0,
            auto_start: false,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            permissions: PermissionSet::new(),
        }
    }
}

impl ServerDefinition {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::Config("server name is required".into()));
        }
        if self.command.trim().is_empty() {
            return Err(GatewayError::Config(format!(
                "server '{}' has no command",
                self.name
            )));
        }
        if self.port < MIN_SERVER_PORT {
            return Err(GatewayError::Config(format!(
                "server '{}' port {} is outside the registerable range 1024-65535",
                self.name, self.port
            )));
        }
        Ok(())
    }
}

/// A (userId, clientApp) pairing seen at session creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredClient {
    pub user_id: String,
    pub client_app: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsSection {
    pub global_defaults: PermissionSet,
}

/// The persisted configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub servers: Vec<ServerDefinition>,
    pub permissions: PermissionsSection,
    /// Keyed `"userId|clientApp"`.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub registered_clients: BTreeMap<String, RegisteredClient>,
    /// Per-pairing explicit category overrides, keyed `"userId|clientApp"`.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub client_permissions: BTreeMap<String, PermissionSet>,
}

impl GatewayConfig {
    /// Load the document; a missing file yields the empty default.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no configuration file, starting empty");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&raw)
            .map_err(|e| GatewayError::Config(format!("{}: {e}", path.display())))
    }

    /// Rewrite the whole document atomically: serialize to a sibling temp
    /// file, then rename over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        let serialized = serde_json::to_vec_pretty(self)
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::PermissionCategory;

    fn valid_definition() -> ServerDefinition {
        ServerDefinition {
            name: "Confluence".into(),
            server_type: "python".into(),
            command: "/usr/bin/python3".into(),
            arguments: vec!["-m".into(), "server".into()],
            port: 8100,
            ..Default::default()
        }
    }

    #[test]
    fn validation_rejects_bad_definitions() {
        let mut def = valid_definition();
        def.name = "  ".into();
        assert!(def.validate().is_err());

        let mut def = valid_definition();
        def.command.clear();
        assert!(def.validate().is_err());

        let mut def = valid_definition();
        def.port = 80;
        assert!(def.validate().is_err());

        assert!(valid_definition().validate().is_ok());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let mut config = GatewayConfig::default();
        let mut def = valid_definition();
        def.permissions.set(PermissionCategory::WriteRemote, Some(true));
        config.servers.push(def);
        config
            .permissions
            .global_defaults
            .set(PermissionCategory::ReadRemote, Some(true));

        config.save(&path).unwrap();
        let loaded = GatewayConfig::load(&path).unwrap();
        assert_eq!(loaded, config);

        // No temp file left behind.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn inherited_permissions_are_not_written() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let mut config = GatewayConfig::default();
        config.servers.push(valid_definition());
        config.save(&path).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("READ_REMOTE"));
        assert!(!raw.contains("\"permissions\": {\""));
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = GatewayConfig::load(&dir.path().join("absent.json")).unwrap();
        assert!(config.servers.is_empty());
    }
}
