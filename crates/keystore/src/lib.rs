//! Encrypted credential store.
//!
//! A single JSON blob, encrypted as one Fernet token (see [`fernet`]), holds
//! every credential the gateway can hand to a tool-server subprocess. Three
//! namespaces coexist inside the blob:
//!
//! - legacy flat: `{ service: { key: value } }` (backward compatibility)
//! - `shared`: credentials usable by any user
//! - `users`: per-user credentials, highest lookup priority
//!
//! plus a `permissions` namespace carrying per-user tool allowlists.
//!
//! Every mutation re-encrypts and rewrites the whole blob; a mutex
//! serializes all load-modify-save cycles within the process. The store
//! never writes partial or unauthenticated data: any encrypt/decrypt failure
//! aborts the operation and leaves the file untouched.

mod fernet;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use parking_lot::Mutex;
use rand::RngCore;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// Default store file name inside a keystore directory.
pub const STORE_FILE: &str = ".keystore";
/// Default master key file name inside a keystore directory.
pub const KEY_FILE: &str = ".keystore.key";

/// Blob keys that are not legacy flat services.
const RESERVED_KEYS: [&str; 4] = ["users", "shared", "permissions", "version"];

#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    #[error("keystore I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("keystore crypto error: {0}")]
    Crypto(String),
    #[error("keystore authentication failed: data may be corrupted or tampered")]
    AuthenticationFailed,
    #[error("invalid master key: {0}")]
    InvalidMasterKey(String),
    #[error("invalid keystore contents: {0}")]
    InvalidContents(String),
}

pub type Result<T> = std::result::Result<T, KeystoreError>;

/// Encrypted key/value store keyed by (optional user, service, key).
pub struct Keystore {
    store_path: PathBuf,
    master_key_path: PathBuf,
    master_key: [u8; 32],
    /// Serializes load-modify-save cycles; the encrypt/decrypt path must not
    /// interleave across callers.
    lock: Mutex<()>,
}

impl Keystore {
    /// Open (or create) the keystore in `dir`, using the default file names.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        Self::with_paths(dir.join(STORE_FILE), dir.join(KEY_FILE))
    }

    /// Open (or create) a keystore with explicit store and master key paths.
    pub fn with_paths(store_path: PathBuf, master_key_path: PathBuf) -> Result<Self> {
        if let Some(parent) = store_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let master_key = if master_key_path.exists() {
            load_master_key(&master_key_path)?
        } else {
            generate_master_key(&master_key_path)?
        };

        Ok(Self {
            store_path,
            master_key_path,
            master_key,
            lock: Mutex::new(()),
        })
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn master_key_path(&self) -> &Path {
        &self.master_key_path
    }

    // ------------------------------------------------------------------
    // Flat (legacy/shared-namespace-free) credential operations
    // ------------------------------------------------------------------

    pub fn set_credential(&self, service: &str, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut data = self.load_blob()?;
        let service_obj = data
            .entry(service.to_string())
            .or_insert_with(|| json!({}));
        if let Some(obj) = service_obj.as_object_mut() {
            obj.insert(key.to_string(), Value::String(value.to_string()));
        }
        self.save_blob(&data)?;
        tracing::debug!(service, key, "stored credential");
        Ok(())
    }

    pub fn get_credential(&self, service: &str, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock();
        let data = self.load_blob()?;
        Ok(lookup(&data, &[service, key]))
    }

    pub fn delete_credential(&self, service: &str, key: &str) -> Result<bool> {
        let _guard = self.lock.lock();
        let mut data = self.load_blob()?;
        let removed = match data.get_mut(service).and_then(Value::as_object_mut) {
            Some(obj) => obj.remove(key).is_some(),
            None => false,
        };
        if !removed {
            return Ok(false);
        }
        // Drop the service object when it becomes empty.
        if data
            .get(service)
            .and_then(Value::as_object)
            .is_some_and(Map::is_empty)
        {
            data.remove(service);
        }
        self.save_blob(&data)?;
        tracing::debug!(service, key, "deleted credential");
        Ok(true)
    }

    /// All credentials stored for a flat service.
    pub fn service_credentials(&self, service: &str) -> Result<Vec<(String, String)>> {
        let _guard = self.lock.lock();
        let data = self.load_blob()?;
        Ok(object_entries(data.get(service).and_then(Value::as_object)))
    }

    pub fn clear_service(&self, service: &str) -> Result<bool> {
        let _guard = self.lock.lock();
        let mut data = self.load_blob()?;
        if data.remove(service).is_none() {
            return Ok(false);
        }
        self.save_blob(&data)?;
        tracing::debug!(service, "cleared service");
        Ok(true)
    }

    /// Top-level service names, reserved namespaces excluded.
    pub fn list_services(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock();
        let data = self.load_blob()?;
        Ok(data
            .keys()
            .filter(|k| !RESERVED_KEYS.contains(&k.as_str()))
            .cloned()
            .collect())
    }

    pub fn list_credentials(&self, service: &str) -> Result<Vec<String>> {
        let _guard = self.lock.lock();
        let data = self.load_blob()?;
        Ok(object_keys(data.get(service).and_then(Value::as_object)))
    }

    // ------------------------------------------------------------------
    // User-scoped credential operations
    // ------------------------------------------------------------------

    pub fn set_user_credential(
        &self,
        user_id: &str,
        service: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let _guard = self.lock.lock();
        let mut data = self.load_blob()?;
        let slot = nested_entry(&mut data, &["users", user_id, service])?;
        slot.insert(key.to_string(), Value::String(value.to_string()));
        self.save_blob(&data)?;
        tracing::debug!(user_id, service, key, "stored user credential");
        Ok(())
    }

    /// Look up a credential for a user. Priority: user-specific, then
    /// `shared`, then the legacy flat namespace; first hit wins.
    pub fn get_user_credential(
        &self,
        user_id: &str,
        service: &str,
        key: &str,
    ) -> Result<Option<String>> {
        let _guard = self.lock.lock();
        let data = self.load_blob()?;

        if let Some(v) = lookup(&data, &["users", user_id, service, key]) {
            return Ok(Some(v));
        }
        if let Some(v) = lookup(&data, &["shared", service, key]) {
            tracing::debug!(user_id, service, key, "using shared credential");
            return Ok(Some(v));
        }
        if let Some(v) = lookup(&data, &[service, key]) {
            tracing::debug!(user_id, service, key, "using legacy flat credential");
            return Ok(Some(v));
        }
        Ok(None)
    }

    pub fn delete_user_credential(&self, user_id: &str, service: &str, key: &str) -> Result<bool> {
        let _guard = self.lock.lock();
        let mut data = self.load_blob()?;

        let removed = nested_get_mut(&mut data, &["users", user_id, service])
            .map(|obj| obj.remove(key).is_some())
            .unwrap_or(false);
        if !removed {
            return Ok(false);
        }
        prune_empty(&mut data, &["users", user_id, service]);
        self.save_blob(&data)?;
        tracing::debug!(user_id, service, key, "deleted user credential");
        Ok(true)
    }

    /// User-specific credentials for a service (no shared/legacy fallback).
    pub fn user_service_credentials(
        &self,
        user_id: &str,
        service: &str,
    ) -> Result<Vec<(String, String)>> {
        let _guard = self.lock.lock();
        let data = self.load_blob()?;
        Ok(object_entries(nested_get(&data, &["users", user_id, service])))
    }

    pub fn clear_user_service(&self, user_id: &str, service: &str) -> Result<bool> {
        let _guard = self.lock.lock();
        let mut data = self.load_blob()?;
        let removed = nested_get_mut(&mut data, &["users", user_id])
            .map(|obj| obj.remove(service).is_some())
            .unwrap_or(false);
        if !removed {
            return Ok(false);
        }
        prune_empty(&mut data, &["users", user_id]);
        self.save_blob(&data)?;
        tracing::debug!(user_id, service, "cleared user service");
        Ok(true)
    }

    pub fn list_users(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock();
        let data = self.load_blob()?;
        Ok(object_keys(data.get("users").and_then(Value::as_object)))
    }

    pub fn list_user_services(&self, user_id: &str) -> Result<Vec<String>> {
        let _guard = self.lock.lock();
        let data = self.load_blob()?;
        Ok(object_keys(nested_get(&data, &["users", user_id])))
    }

    /// Migrate every legacy flat service into `users[user_id]`, or into
    /// `shared` when `user_id` is empty. Existing user entries are never
    /// overwritten. Returns the number of migrated services.
    pub fn migrate_to_user(&self, user_id: &str) -> Result<usize> {
        let _guard = self.lock.lock();
        let mut data = self.load_blob()?;

        let legacy: Vec<String> = data
            .keys()
            .filter(|k| !RESERVED_KEYS.contains(&k.as_str()))
            .cloned()
            .collect();
        if legacy.is_empty() {
            return Ok(0);
        }

        let mut moved = Map::new();
        for name in &legacy {
            if let Some(v) = data.remove(name) {
                moved.insert(name.clone(), v);
            }
        }
        let migrated = moved.len();

        if user_id.is_empty() {
            let shared = nested_entry(&mut data, &["shared"])?;
            for (name, v) in moved {
                shared.entry(name).or_insert(v);
            }
            tracing::info!(migrated, "migrated legacy services to shared");
        } else {
            let user = nested_entry(&mut data, &["users", user_id])?;
            for (name, v) in moved {
                user.entry(name).or_insert(v);
            }
            tracing::info!(migrated, user_id, "migrated legacy services to user");
        }

        data.insert("version".to_string(), Value::String("2.0".to_string()));
        self.save_blob(&data)?;
        Ok(migrated)
    }

    // ------------------------------------------------------------------
    // Per-user tool allowlists
    // ------------------------------------------------------------------

    /// Record the tools a user may call on a service. An empty list clears
    /// the restriction (the user falls back to server/global rules).
    pub fn set_user_permissions(
        &self,
        user_id: &str,
        service: &str,
        tools: &[String],
    ) -> Result<()> {
        let _guard = self.lock.lock();
        let mut data = self.load_blob()?;
        if tools.is_empty() {
            if let Some(obj) = nested_get_mut(&mut data, &["permissions", user_id]) {
                obj.remove(service);
            }
            prune_empty(&mut data, &["permissions", user_id]);
        } else {
            let slot = nested_entry(&mut data, &["permissions", user_id])?;
            slot.insert(
                service.to_string(),
                Value::Array(tools.iter().cloned().map(Value::String).collect()),
            );
        }
        self.save_blob(&data)?;
        tracing::debug!(user_id, service, count = tools.len(), "set user permissions");
        Ok(())
    }

    /// Tool allowlist for (user, service). Empty means "no explicit
    /// restriction recorded".
    pub fn get_user_permissions(&self, user_id: &str, service: &str) -> Result<Vec<String>> {
        let _guard = self.lock.lock();
        let data = self.load_blob()?;
        let list = nested_get(&data, &["permissions", user_id])
            .and_then(|obj| obj.get(service))
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(list)
    }

    /// True when the user may call `tool` on `service`: either the tool is
    /// allowlisted, or no restriction is recorded at all.
    pub fn has_user_permission(&self, user_id: &str, service: &str, tool: &str) -> Result<bool> {
        let perms = self.get_user_permissions(user_id, service)?;
        Ok(perms.is_empty() || perms.iter().any(|t| t == tool))
    }

    // ------------------------------------------------------------------
    // Blob I/O
    // ------------------------------------------------------------------

    fn load_blob(&self) -> Result<Map<String, Value>> {
        if !self.store_path.exists() {
            return Ok(Map::new());
        }
        let encoded = fs::read(&self.store_path)?;
        if encoded.is_empty() {
            return Ok(Map::new());
        }
        let plaintext = fernet::decrypt(&self.master_key, &encoded)?;
        let value: Value = serde_json::from_slice(&plaintext)
            .map_err(|e| KeystoreError::InvalidContents(e.to_string()))?;
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(KeystoreError::InvalidContents(
                "keystore root must be a JSON object".into(),
            )),
        }
    }

    fn save_blob(&self, data: &Map<String, Value>) -> Result<()> {
        let plaintext = serde_json::to_vec(&Value::Object(data.clone()))
            .map_err(|e| KeystoreError::InvalidContents(e.to_string()))?;
        let token = fernet::encrypt(&self.master_key, &plaintext)?;
        fs::write(&self.store_path, token)?;
        set_owner_only(&self.store_path)?;
        Ok(())
    }
}

impl Drop for Keystore {
    fn drop(&mut self) {
        // Best-effort scrub of the key material.
        self.master_key.fill(0);
    }
}

fn load_master_key(path: &Path) -> Result<[u8; 32]> {
    let encoded = fs::read(path)?;
    let raw = URL_SAFE_NO_PAD
        .decode(encoded.trim_ascii())
        .map_err(|_| KeystoreError::InvalidMasterKey("not valid base64url".into()))?;
    let key: [u8; 32] = raw
        .try_into()
        .map_err(|_| KeystoreError::InvalidMasterKey("decoded key is not 32 bytes".into()))?;
    tracing::debug!(path = %path.display(), "loaded existing master key");
    Ok(key)
}

fn generate_master_key(path: &Path) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    fs::write(path, URL_SAFE_NO_PAD.encode(key))?;
    set_owner_only(path)?;
    tracing::info!(path = %path.display(), "generated new master key");
    Ok(key)
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> Result<()> {
    Ok(())
}

// ----------------------------------------------------------------------
// JSON object helpers
// ----------------------------------------------------------------------

/// Walk a path of object keys; the final segment is read as a string.
fn lookup(data: &Map<String, Value>, path: &[&str]) -> Option<String> {
    let (last, parents) = path.split_last()?;
    let mut obj = data;
    for seg in parents {
        obj = obj.get(*seg)?.as_object()?;
    }
    obj.get(*last)?.as_str().map(str::to_string)
}

fn nested_get<'a>(data: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Map<String, Value>> {
    let mut obj = data;
    for seg in path {
        obj = obj.get(*seg)?.as_object()?;
    }
    Some(obj)
}

fn nested_get_mut<'a>(
    data: &'a mut Map<String, Value>,
    path: &[&str],
) -> Option<&'a mut Map<String, Value>> {
    let mut obj = data;
    for seg in path {
        obj = obj.get_mut(*seg)?.as_object_mut()?;
    }
    Some(obj)
}

/// Walk a path of object keys, creating empty objects along the way.
/// Fails when a pre-existing intermediate value is not an object.
fn nested_entry<'a>(
    data: &'a mut Map<String, Value>,
    path: &[&str],
) -> Result<&'a mut Map<String, Value>> {
    let mut obj = data;
    for seg in path {
        obj = obj
            .entry(seg.to_string())
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .ok_or_else(|| {
                KeystoreError::InvalidContents(format!("'{seg}' is not an object"))
            })?;
    }
    Ok(obj)
}

fn object_keys(obj: Option<&Map<String, Value>>) -> Vec<String> {
    obj.map(|m| m.keys().cloned().collect()).unwrap_or_default()
}

/// String-valued entries of an object; anything non-string is skipped.
fn object_entries(obj: Option<&Map<String, Value>>) -> Vec<(String, String)> {
    obj.map(|m| {
        m.iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect()
    })
    .unwrap_or_default()
}

/// Remove empty objects walking back up `path` (deepest first).
fn prune_empty(data: &mut Map<String, Value>, path: &[&str]) {
    for depth in (1..=path.len()).rev() {
        let (parents, tail) = path[..depth].split_at(depth - 1);
        let empty = nested_get(data, &path[..depth]).is_some_and(Map::is_empty);
        if !empty {
            return;
        }
        match parents.len() {
            0 => {
                data.remove(tail[0]);
            }
            _ => {
                if let Some(parent) = nested_get_mut(data, parents) {
                    parent.remove(tail[0]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Keystore {
        Keystore::open(dir.path()).expect("open keystore")
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.set_credential("azure", "pat", "secret-1").unwrap();
        assert_eq!(
            store.get_credential("azure", "pat").unwrap().as_deref(),
            Some("secret-1")
        );

        assert!(store.delete_credential("azure", "pat").unwrap());
        assert_eq!(store.get_credential("azure", "pat").unwrap(), None);
        // Empty service object was pruned.
        assert!(store.list_services().unwrap().is_empty());
    }

    #[test]
    fn reopen_with_persisted_key() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            store.set_credential("svc", "k", "v").unwrap();
        }
        let store = open_store(&dir);
        assert_eq!(
            store.get_credential("svc", "k").unwrap().as_deref(),
            Some("v")
        );
    }

    #[test]
    fn user_lookup_priority() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        // Shared namespace has no dedicated setter in the public API;
        // migration with an empty user id is how entries land there.
        store.set_credential("jira", "token", "shared-j").unwrap();
        store.migrate_to_user("").unwrap();

        store.set_credential("confluence", "token", "legacy").unwrap();
        store
            .set_user_credential("a@x.com", "confluence", "token", "T1")
            .unwrap();

        assert_eq!(
            store
                .get_user_credential("a@x.com", "confluence", "token")
                .unwrap()
                .as_deref(),
            Some("T1")
        );
        // No user entry: shared wins over legacy.
        assert_eq!(
            store
                .get_user_credential("b@x.com", "jira", "token")
                .unwrap()
                .as_deref(),
            Some("shared-j")
        );
        // Neither user nor shared: legacy flat.
        assert_eq!(
            store
                .get_user_credential("b@x.com", "confluence", "token")
                .unwrap()
                .as_deref(),
            Some("legacy")
        );
        // Nothing at all.
        assert_eq!(
            store
                .get_user_credential("b@x.com", "missing", "token")
                .unwrap(),
            None
        );
    }

    #[test]
    fn migrate_legacy_to_user() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.set_credential("azure", "pat", "legacy-pat").unwrap();
        store.set_credential("chatns", "api_key", "legacy-key").unwrap();
        // Pre-existing user entry must survive migration untouched.
        store
            .set_user_credential("u@x.com", "azure", "pat", "user-pat")
            .unwrap();

        let migrated = store.migrate_to_user("u@x.com").unwrap();
        assert_eq!(migrated, 2);

        assert!(store.list_services().unwrap().is_empty());
        assert_eq!(
            store
                .get_user_credential("u@x.com", "azure", "pat")
                .unwrap()
                .as_deref(),
            Some("user-pat")
        );
        assert_eq!(
            store
                .get_user_credential("u@x.com", "chatns", "api_key")
                .unwrap()
                .as_deref(),
            Some("legacy-key")
        );

        // Nothing left to migrate.
        assert_eq!(store.migrate_to_user("u@x.com").unwrap(), 0);
    }

    #[test]
    fn user_permissions_allowlist() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        // No restriction recorded: everything is permitted.
        assert!(store.has_user_permission("u", "azure", "anything").unwrap());

        store
            .set_user_permissions("u", "azure", &["wit_get".into(), "wit_list".into()])
            .unwrap();
        assert!(store.has_user_permission("u", "azure", "wit_get").unwrap());
        assert!(!store.has_user_permission("u", "azure", "wit_delete").unwrap());
        assert_eq!(store.get_user_permissions("u", "azure").unwrap().len(), 2);

        // Clearing the allowlist removes the restriction.
        store.set_user_permissions("u", "azure", &[]).unwrap();
        assert!(store.has_user_permission("u", "azure", "wit_delete").unwrap());
    }

    #[test]
    fn corrupt_namespace_errors_instead_of_panicking() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        // A flat write can leave a string where the user namespace expects
        // an object; walking through it must fail, not panic.
        store.set_credential("users", "alice", "oops").unwrap();
        assert!(matches!(
            store.set_user_credential("alice", "svc", "k", "v"),
            Err(KeystoreError::InvalidContents(_))
        ));
    }

    #[test]
    fn tampered_store_fails_closed() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.set_credential("svc", "k", "v").unwrap();

        // Corrupt one byte of the stored token.
        let path = store.store_path().to_path_buf();
        let mut contents = std::fs::read(&path).unwrap();
        let mid = contents.len() / 2;
        contents[mid] = if contents[mid] == b'A' { b'B' } else { b'A' };
        std::fs::write(&path, &contents).unwrap();

        assert!(store.get_credential("svc", "k").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.set_credential("svc", "k", "v").unwrap();

        for path in [store.store_path(), store.master_key_path()] {
            let mode = std::fs::metadata(path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{}", path.display());
        }
    }
}
