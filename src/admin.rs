use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::errors::PermError;
use crate::perms::types::{normalize_group_name, normalize_node, Group, Membership};
use crate::perms::{GroupStore, IdentityCache, Resolver};

/// Administrative command surface.
///
/// Every mutation is refused with [`PermError::AuthorityActive`] while an external
/// authority owns the data; reads stay available.
pub struct Admin {
    groups: Arc<GroupStore>,
    identities: Arc<IdentityCache>,
    resolver: Resolver,
}

/// Stored and resolved view of a single identity.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityInfo {
    pub id: Uuid,
    pub display_name: String,
    pub primary_group: String,
    pub groups: Vec<Membership>,
    /// Explicit per-identity entries, sorted by node
    pub permissions: Vec<(String, bool)>,
    pub prefix: String,
    pub suffix: String,
    pub effective_primary_group: String,
    pub effective_prefix: String,
    pub effective_suffix: String,
}

impl Admin {
    pub fn new(groups: Arc<GroupStore>, identities: Arc<IdentityCache>, resolver: Resolver) -> Self {
        Self {
            groups,
            identities,
            resolver,
        }
    }

    fn ensure_local(&self) -> Result<(), PermError> {
        if self.resolver.is_delegating() {
            Err(PermError::AuthorityActive)
        } else {
            Ok(())
        }
    }

    fn ensure_group(&self, name: &str) -> Result<String, PermError> {
        let key = normalize_group_name(name);
        if self.groups.exists(&key) {
            Ok(key)
        } else {
            Err(PermError::NotFound(key))
        }
    }

    // ---------- groups ----------

    pub async fn create_group(&self, name: &str) -> Result<Arc<Group>, PermError> {
        self.ensure_local()?;
        self.groups.create(name).await
    }

    pub async fn delete_group(&self, name: &str) -> Result<(), PermError> {
        self.ensure_local()?;
        self.groups.delete(name).await
    }

    pub fn list_groups(&self) -> Vec<Arc<Group>> {
        self.groups.list()
    }

    pub async fn set_group_permission(
        &self,
        group: &str,
        node: &str,
        value: bool,
    ) -> Result<Arc<Group>, PermError> {
        self.ensure_local()?;
        self.groups.set_permission(group, node, value).await
    }

    pub async fn unset_group_permission(
        &self,
        group: &str,
        node: &str,
    ) -> Result<Arc<Group>, PermError> {
        self.ensure_local()?;
        self.groups.unset_permission(group, node).await
    }

    pub async fn set_group_prefix(&self, group: &str, prefix: &str) -> Result<Arc<Group>, PermError> {
        self.ensure_local()?;
        self.groups.set_prefix(group, prefix).await
    }

    pub async fn set_group_suffix(&self, group: &str, suffix: &str) -> Result<Arc<Group>, PermError> {
        self.ensure_local()?;
        self.groups.set_suffix(group, suffix).await
    }

    pub async fn set_group_weight(&self, group: &str, weight: i64) -> Result<Arc<Group>, PermError> {
        self.ensure_local()?;
        self.groups.set_weight(group, weight).await
    }

    pub async fn set_group_display_name(
        &self,
        group: &str,
        display_name: &str,
    ) -> Result<Arc<Group>, PermError> {
        self.ensure_local()?;
        self.groups.set_display_name(group, display_name).await
    }

    /// Set or, with `None`, clear the parent of `group`.
    pub async fn set_group_parent(
        &self,
        group: &str,
        parent: Option<&str>,
    ) -> Result<Arc<Group>, PermError> {
        self.ensure_local()?;
        self.groups.set_parent(group, parent).await
    }

    // ---------- identities ----------

    pub async fn set_identity_permission(
        &self,
        id: Uuid,
        node: &str,
        value: bool,
    ) -> Result<(), PermError> {
        self.ensure_local()?;
        let node = normalize_node(node);
        if node.is_empty() {
            return Err(PermError::Other("permission node must not be empty".into()));
        }
        self.identities
            .update(id, |i| {
                i.permissions.insert(node, value);
            })
            .await?;
        Ok(())
    }

    pub async fn unset_identity_permission(&self, id: Uuid, node: &str) -> Result<(), PermError> {
        self.ensure_local()?;
        let node = normalize_node(node);
        self.identities
            .update(id, |i| {
                i.permissions.remove(&node);
            })
            .await?;
        Ok(())
    }

    /// Add `id` to `group`, optionally until the unix timestamp `expires_at`.
    /// An existing membership has its expiry replaced.
    pub async fn add_identity_group(
        &self,
        id: Uuid,
        group: &str,
        expires_at: Option<i64>,
    ) -> Result<(), PermError> {
        self.ensure_local()?;
        let key = self.ensure_group(group)?;
        if let Some(at) = expires_at {
            if at <= Utc::now().timestamp() {
                return Err(PermError::Other(format!(
                    "membership expiry {} is already in the past",
                    at
                )));
            }
        }

        self.identities
            .update(id, |i| {
                i.additional_groups.retain(|m| m.group != key);
                i.additional_groups.push(match expires_at {
                    Some(at) => Membership::until(&key, at),
                    None => Membership::permanent(&key),
                });
            })
            .await?;
        info!(identity = %id, group = %key, ?expires_at, "Added identity to group");
        Ok(())
    }

    /// Returns whether a membership was removed.
    pub async fn remove_identity_group(&self, id: Uuid, group: &str) -> Result<bool, PermError> {
        self.ensure_local()?;
        let key = normalize_group_name(group);
        if self.identities.get_or_load(id).await.membership(&key).is_none() {
            return Ok(false);
        }

        self.identities
            .update(id, |i| i.additional_groups.retain(|m| m.group != key))
            .await?;
        info!(identity = %id, group = %key, "Removed identity from group");
        Ok(true)
    }

    pub async fn set_identity_primary_group(&self, id: Uuid, group: &str) -> Result<(), PermError> {
        self.ensure_local()?;
        let key = self.ensure_group(group)?;
        self.identities
            .update(id, |i| i.primary_group = key)
            .await?;
        Ok(())
    }

    /// Set the identity's own prefix, or clear it with `None` to defer to its groups.
    pub async fn set_identity_prefix(&self, id: Uuid, prefix: Option<&str>) -> Result<(), PermError> {
        self.ensure_local()?;
        let prefix = prefix.unwrap_or_default().to_string();
        self.identities.update(id, |i| i.prefix = prefix).await?;
        Ok(())
    }

    pub async fn set_identity_suffix(&self, id: Uuid, suffix: Option<&str>) -> Result<(), PermError> {
        self.ensure_local()?;
        let suffix = suffix.unwrap_or_default().to_string();
        self.identities.update(id, |i| i.suffix = suffix).await?;
        Ok(())
    }

    pub async fn identity_info(&self, id: Uuid) -> IdentityInfo {
        let identity = self.identities.get_or_load(id).await;
        let now = Utc::now().timestamp();

        let mut permissions: Vec<(String, bool)> = identity
            .permissions
            .iter()
            .map(|(node, value)| (node.clone(), *value))
            .collect();
        permissions.sort();

        IdentityInfo {
            id,
            display_name: identity.display_name.clone(),
            primary_group: identity.primary_group.clone(),
            groups: identity.active_memberships(now).cloned().collect(),
            permissions,
            prefix: identity.prefix.clone(),
            suffix: identity.suffix.clone(),
            effective_primary_group: self.resolver.get_primary_group(id).await,
            effective_prefix: self.resolver.get_prefix(id).await,
            effective_suffix: self.resolver.get_suffix(id).await,
        }
    }
}
