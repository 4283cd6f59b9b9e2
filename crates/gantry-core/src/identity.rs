//! Identities, permissions, and the access policy store.
//!
//! The policy store maps `(identity, environment)` to an explicit
//! permission set. There is no implicit inheritance across environments:
//! holding `promote` on "staging" says nothing about "prod". Grants and
//! revocations are administrative operations recorded in an append-only
//! audit log.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A human or service principal, pre-verified by an external identity
/// provider. Gantry treats both kinds uniformly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(pub String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Identity(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Namespace-scoped permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Deploy,
    Promote,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Deploy => "deploy",
            Permission::Promote => "promote",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Permission::Read),
            "deploy" => Ok(Permission::Deploy),
            "promote" => Ok(Permission::Promote),
            other => Err(format!("unknown permission: {other}")),
        }
    }
}

/// Whether a policy change granted or revoked a permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Grant,
    Revoke,
}

/// One entry in the append-only policy audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyChange {
    pub kind: ChangeKind,
    pub identity: String,
    pub environment: String,
    pub permission: Permission,
    pub at: DateTime<Utc>,
}

/// Serializable form of the policy store: explicit grants plus the audit
/// log. This is the on-disk format used by the CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub grants: Vec<GrantEntry>,
    #[serde(default)]
    pub audit: Vec<PolicyChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantEntry {
    pub identity: String,
    pub environment: String,
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Default)]
struct PolicyInner {
    grants: HashMap<(String, String), HashSet<Permission>>,
    audit: Vec<PolicyChange>,
}

/// Explicit `(identity, environment) -> permission set` mapping.
///
/// Consulted synchronously before every promotion; denial is a hard stop.
#[derive(Debug, Default)]
pub struct PolicyStore {
    inner: Mutex<PolicyInner>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from its serialized form.
    pub fn from_document(doc: PolicyDocument) -> Self {
        let mut inner = PolicyInner {
            grants: HashMap::new(),
            audit: doc.audit,
        };
        for entry in doc.grants {
            inner
                .grants
                .entry((entry.identity, entry.environment))
                .or_default()
                .extend(entry.permissions);
        }
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Serialize grants and audit log, grants sorted for stable output.
    pub fn to_document(&self) -> PolicyDocument {
        let inner = self.inner.lock().unwrap();
        let mut grants: Vec<GrantEntry> = inner
            .grants
            .iter()
            .filter(|(_, perms)| !perms.is_empty())
            .map(|((identity, environment), perms)| {
                let mut permissions: Vec<Permission> = perms.iter().copied().collect();
                permissions.sort_by_key(|p| p.as_str());
                GrantEntry {
                    identity: identity.clone(),
                    environment: environment.clone(),
                    permissions,
                }
            })
            .collect();
        grants.sort_by(|a, b| {
            (a.identity.as_str(), a.environment.as_str())
                .cmp(&(b.identity.as_str(), b.environment.as_str()))
        });
        PolicyDocument {
            grants,
            audit: inner.audit.clone(),
        }
    }

    /// Grant a permission to an identity in one environment.
    pub fn grant(&self, identity: &Identity, environment: &str, permission: Permission) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .grants
            .entry((identity.0.clone(), environment.to_string()))
            .or_default()
            .insert(permission);
        inner.audit.push(PolicyChange {
            kind: ChangeKind::Grant,
            identity: identity.0.clone(),
            environment: environment.to_string(),
            permission,
            at: Utc::now(),
        });
        info!(identity = %identity, environment, permission = %permission, "policy grant");
    }

    /// Revoke a permission from an identity in one environment.
    pub fn revoke(&self, identity: &Identity, environment: &str, permission: Permission) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(perms) = inner
            .grants
            .get_mut(&(identity.0.clone(), environment.to_string()))
        {
            perms.remove(&permission);
        }
        inner.audit.push(PolicyChange {
            kind: ChangeKind::Revoke,
            identity: identity.0.clone(),
            environment: environment.to_string(),
            permission,
            at: Utc::now(),
        });
        info!(identity = %identity, environment, permission = %permission, "policy revoke");
    }

    /// Whether the identity holds the permission in the environment.
    pub fn authorize(&self, identity: &Identity, permission: Permission, environment: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .grants
            .get(&(identity.0.clone(), environment.to_string()))
            .map(|perms| perms.contains(&permission))
            .unwrap_or(false)
    }

    /// Snapshot of the append-only audit log, oldest first.
    pub fn audit_log(&self) -> Vec<PolicyChange> {
        self.inner.lock().unwrap().audit.clone()
    }
}
