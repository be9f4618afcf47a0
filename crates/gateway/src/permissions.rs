//! Permission categories and their scope-layered resolution.
//!
//! A [`PermissionSet`] records only explicit decisions; a category that is
//! absent inherits from the next scope down. Resolution is a fold from the
//! built-in defaults through the scopes in least-to-most-specific order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Closed set of tool risk categories, ordered by increasing risk.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PermissionCategory {
    #[serde(rename = "READ_REMOTE")]
    ReadRemote,
    #[serde(rename = "WRITE_REMOTE")]
    WriteRemote,
    #[serde(rename = "WRITE_LOCAL")]
    WriteLocal,
    #[serde(rename = "EXECUTE_AI")]
    ExecuteAi,
    #[serde(rename = "EXECUTE_CODE")]
    ExecuteCode,
}

impl PermissionCategory {
    pub const ALL: [PermissionCategory; 5] = [
        PermissionCategory::ReadRemote,
        PermissionCategory::WriteRemote,
        PermissionCategory::WriteLocal,
        PermissionCategory::ExecuteAi,
        PermissionCategory::ExecuteCode,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PermissionCategory::ReadRemote => "READ_REMOTE",
            PermissionCategory::WriteRemote => "WRITE_REMOTE",
            PermissionCategory::WriteLocal => "WRITE_LOCAL",
            PermissionCategory::ExecuteAi => "EXECUTE_AI",
            PermissionCategory::ExecuteCode => "EXECUTE_CODE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == s)
    }

    /// Built-in default when no scope says anything. Only remote reads are
    /// allowed out of the box.
    pub fn default_allowed(self) -> bool {
        matches!(self, PermissionCategory::ReadRemote)
    }
}

impl fmt::Display for PermissionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit per-category decisions for one scope (global, server, client).
/// Serializes as an object with category-name keys; only explicit entries
/// are written, so inherited values never leak into persisted config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet {
    entries: BTreeMap<PermissionCategory, bool>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, category: PermissionCategory) -> Option<bool> {
        self.entries.get(&category).copied()
    }

    /// `None` clears the explicit entry so the scope inherits again.
    pub fn set(&mut self, category: PermissionCategory, value: Option<bool>) {
        match value {
            Some(v) => {
                self.entries.insert(category, v);
            }
            None => {
                self.entries.remove(&category);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PermissionCategory, bool)> + '_ {
        self.entries.iter().map(|(c, v)| (*c, *v))
    }
}

/// Resolve a category across scopes, least specific first. The most
/// specific scope with an explicit entry wins; with none, the built-in
/// default applies.
pub fn resolve(category: PermissionCategory, scopes: &[&PermissionSet]) -> bool {
    let mut value = category.default_allowed();
    for scope in scopes {
        if let Some(v) = scope.get(category) {
            value = v;
        }
    }
    value
}
