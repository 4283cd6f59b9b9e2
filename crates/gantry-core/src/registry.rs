//! Artifact registry: environments, tag bindings, and atomic promotion.
//!
//! Promotion is the only operation that moves an artifact into a target
//! environment, and a completed rebind is the sole trigger for deployment
//! notifications. At most one promotion per destination `(env, tag)` is
//! in flight at a time; concurrent attempts get [`Error::Conflict`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use gantry_state::{ImageDigest, StorageError, TagBinding, TagStore};

use crate::error::{from_lookup, Error, Result};
use crate::identity::{Identity, Permission, PolicyStore};

/// Emitted after a tag binding changes. Deployment machinery subscribes
/// per environment; there is no other deployment trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagMoved {
    pub environment: String,
    pub tag: String,
    pub digest: ImageDigest,
    pub moved_by: String,
    pub at: DateTime<Utc>,
}

/// Removes the destination key from the in-flight set when the promotion
/// attempt ends, on any path.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<(String, String)>>,
    key: (String, String),
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.key);
    }
}

pub struct ArtifactRegistry {
    tags: Arc<dyn TagStore>,
    policy: Arc<PolicyStore>,
    in_flight: Mutex<HashSet<(String, String)>>,
    listeners: Mutex<HashMap<String, broadcast::Sender<TagMoved>>>,
}

impl ArtifactRegistry {
    pub fn new(tags: Arc<dyn TagStore>, policy: Arc<PolicyStore>) -> Self {
        Self {
            tags,
            policy,
            in_flight: Mutex::new(HashSet::new()),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Create an environment. Idempotent.
    pub async fn create_env(&self, name: &str) -> Result<()> {
        self.tags.create_env(name).await.map_err(from_lookup)
    }

    /// Resolve a tag to its current digest.
    pub async fn resolve(&self, env: &str, tag: &str) -> Result<ImageDigest> {
        self.tags.resolve(env, tag).await.map_err(from_lookup)
    }

    /// Full binding history for a tag, newest first.
    pub async fn history(&self, env: &str, tag: &str) -> Result<Vec<TagBinding>> {
        self.tags.history(env, tag).await.map_err(from_lookup)
    }

    /// Bind a tag directly to a digest. Requires `deploy` on the
    /// environment. Used for seeding artifacts outside a promotion.
    pub async fn set_tag(
        &self,
        env: &str,
        tag: &str,
        digest: &ImageDigest,
        by: &Identity,
    ) -> Result<TagBinding> {
        self.authorize(by, Permission::Deploy, env)?;
        let binding = self
            .tags
            .bind(env, tag, digest, by.as_str())
            .await
            .map_err(from_lookup)?;
        self.notify(env, tag, digest, by);
        Ok(binding)
    }

    /// Atomically promote an artifact between environments.
    ///
    /// Resolves the source tag, then rebinds the destination tag to that
    /// digest. The source is read exactly once; a concurrent rebind of the
    /// source after that read does not affect this promotion. Promoting a
    /// digest the destination already carries is a no-op that succeeds
    /// without a new binding or notification.
    pub async fn promote(
        &self,
        source_env: &str,
        source_tag: &str,
        target_env: &str,
        target_tag: &str,
        by: &Identity,
    ) -> Result<ImageDigest> {
        self.authorize(by, Permission::Promote, target_env)?;

        let key = (target_env.to_string(), target_tag.to_string());
        let _guard = {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(key.clone()) {
                return Err(Error::Conflict {
                    env: target_env.to_string(),
                    tag: target_tag.to_string(),
                });
            }
            InFlightGuard {
                set: &self.in_flight,
                key,
            }
        };

        let digest = self
            .tags
            .resolve(source_env, source_tag)
            .await
            .map_err(from_lookup)?;

        match self.tags.resolve(target_env, target_tag).await {
            Ok(current) if current == digest => {
                info!(
                    source_env,
                    source_tag,
                    target_env,
                    target_tag,
                    digest = digest.short(),
                    "promotion is a no-op, destination already current"
                );
                return Ok(digest);
            }
            Ok(_) | Err(StorageError::TagNotFound { .. }) => {}
            Err(other) => return Err(from_lookup(other)),
        }

        self.tags
            .bind(target_env, target_tag, &digest, by.as_str())
            .await
            .map_err(from_lookup)?;

        info!(
            source_env,
            source_tag,
            target_env,
            target_tag,
            digest = digest.short(),
            by = by.as_str(),
            "artifact promoted"
        );
        self.notify(target_env, target_tag, &digest, by);
        Ok(digest)
    }

    /// Rebind a tag to its previous digest. Requires `deploy` on the
    /// environment. The rollback itself is appended to the history.
    pub async fn rollback(&self, env: &str, tag: &str, by: &Identity) -> Result<ImageDigest> {
        self.authorize(by, Permission::Deploy, env)?;

        let history = self.tags.history(env, tag).await.map_err(from_lookup)?;
        let previous = history
            .get(1)
            .ok_or_else(|| {
                from_lookup(StorageError::NoPreviousBinding {
                    env: env.to_string(),
                    tag: tag.to_string(),
                })
            })?
            .digest
            .clone();

        self.tags
            .bind(env, tag, &previous, by.as_str())
            .await
            .map_err(from_lookup)?;

        info!(env, tag, digest = previous.short(), by = by.as_str(), "tag rolled back");
        self.notify(env, tag, &previous, by);
        Ok(previous)
    }

    /// Subscribe to tag movements in one environment.
    pub fn subscribe(&self, env: &str) -> broadcast::Receiver<TagMoved> {
        let mut listeners = self.listeners.lock().unwrap();
        listeners
            .entry(env.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe()
    }

    fn authorize(&self, by: &Identity, permission: Permission, env: &str) -> Result<()> {
        if self.policy.authorize(by, permission, env) {
            Ok(())
        } else {
            Err(Error::PermissionDenied {
                identity: by.as_str().to_string(),
                action: permission.as_str().to_string(),
                environment: env.to_string(),
            })
        }
    }

    fn notify(&self, env: &str, tag: &str, digest: &ImageDigest, by: &Identity) {
        let listeners = self.listeners.lock().unwrap();
        if let Some(tx) = listeners.get(env) {
            // Errors only mean no live subscribers.
            let _ = tx.send(TagMoved {
                environment: env.to_string(),
                tag: tag.to_string(),
                digest: digest.clone(),
                moved_by: by.as_str().to_string(),
                at: Utc::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use gantry_state::fakes::MemoryTagStore;

    use super::*;

    fn registry_with(grants: &[(&str, &str, Permission)]) -> ArtifactRegistry {
        let policy = Arc::new(PolicyStore::new());
        for (who, env, perm) in grants {
            policy.grant(&Identity::new(*who), env, *perm);
        }
        ArtifactRegistry::new(Arc::new(MemoryTagStore::new()), policy)
    }

    async fn seed(registry: &ArtifactRegistry, env: &str, tag: &str, data: &[u8], by: &Identity) -> ImageDigest {
        let digest = ImageDigest::from_bytes(data);
        registry.create_env(env).await.unwrap();
        registry.set_tag(env, tag, &digest, by).await.unwrap();
        digest
    }

    #[tokio::test]
    async fn promote_rebinds_target_and_notifies() {
        let registry = registry_with(&[
            ("alice", "dev", Permission::Deploy),
            ("alice", "prod", Permission::Promote),
        ]);
        let alice = Identity::new("alice");
        let digest = seed(&registry, "dev", "latest", b"v1", &alice).await;
        registry.create_env("prod").await.unwrap();

        let mut rx = registry.subscribe("prod");
        let promoted = registry
            .promote("dev", "latest", "prod", "latest", &alice)
            .await
            .unwrap();
        assert_eq!(promoted, digest);
        assert_eq!(registry.resolve("prod", "latest").await.unwrap(), digest);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.environment, "prod");
        assert_eq!(event.digest, digest);
        assert_eq!(event.moved_by, "alice");
    }

    #[tokio::test]
    async fn promote_requires_permission_on_target() {
        let registry = registry_with(&[("alice", "dev", Permission::Deploy)]);
        let alice = Identity::new("alice");
        seed(&registry, "dev", "latest", b"v1", &alice).await;
        registry.create_env("prod").await.unwrap();

        let err = registry
            .promote("dev", "latest", "prod", "latest", &alice)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));
        assert!(matches!(
            registry.resolve("prod", "latest").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn promote_missing_source_is_not_found() {
        let registry = registry_with(&[("alice", "prod", Permission::Promote)]);
        registry.create_env("dev").await.unwrap();
        registry.create_env("prod").await.unwrap();

        let err = registry
            .promote("dev", "latest", "prod", "latest", &Identity::new("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn repeat_promotion_of_same_digest_is_a_noop() {
        let registry = registry_with(&[
            ("alice", "dev", Permission::Deploy),
            ("alice", "prod", Permission::Promote),
        ]);
        let alice = Identity::new("alice");
        seed(&registry, "dev", "latest", b"v1", &alice).await;
        registry.create_env("prod").await.unwrap();

        registry
            .promote("dev", "latest", "prod", "latest", &alice)
            .await
            .unwrap();
        let mut rx = registry.subscribe("prod");
        registry
            .promote("dev", "latest", "prod", "latest", &alice)
            .await
            .unwrap();

        // One binding, no second notification.
        assert_eq!(registry.history("prod", "latest").await.unwrap().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rollback_restores_previous_binding() {
        let registry = registry_with(&[("alice", "prod", Permission::Deploy)]);
        let alice = Identity::new("alice");
        let v1 = seed(&registry, "prod", "latest", b"v1", &alice).await;
        let v2 = ImageDigest::from_bytes(b"v2");
        registry.set_tag("prod", "latest", &v2, &alice).await.unwrap();

        let restored = registry.rollback("prod", "latest", &alice).await.unwrap();
        assert_eq!(restored, v1);
        assert_eq!(registry.resolve("prod", "latest").await.unwrap(), v1);
        // The rollback appends rather than rewriting history.
        assert_eq!(registry.history("prod", "latest").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn rollback_without_history_is_not_found() {
        let registry = registry_with(&[("alice", "prod", Permission::Deploy)]);
        let alice = Identity::new("alice");
        seed(&registry, "prod", "latest", b"v1", &alice).await;

        let err = registry.rollback("prod", "latest", &alice).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn concurrent_promotions_to_same_destination_conflict() {
        let registry = Arc::new(registry_with(&[
            ("alice", "dev", Permission::Deploy),
            ("alice", "prod", Permission::Promote),
        ]));
        let alice = Identity::new("alice");
        seed(&registry, "dev", "latest", b"v1", &alice).await;
        registry.create_env("prod").await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let alice = alice.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .promote("dev", "latest", "prod", "latest", &alice)
                    .await
            }));
        }

        let mut ok = 0;
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(Error::Conflict { .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(ok >= 1);
        assert_eq!(ok + conflicts, 8);

        let expected = ImageDigest::from_bytes(b"v1");
        assert_eq!(registry.resolve("prod", "latest").await.unwrap(), expected);
    }
}
