//! Group based permission resolution.
//!
//! [`PermissionEngine`] wires the group store, the identity cache and the resolver
//! together and is the handle game-server glue holds on to.

pub mod authority;
pub mod groups;
pub mod identities;
pub mod matcher;
pub mod resolver;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::admin::Admin;
use crate::errors::PermError;
use crate::settings;
use crate::storage::PermissionStore;

pub use authority::{ExternalAuthority, Tristate};
pub use groups::GroupStore;
pub use identities::IdentityCache;
pub use resolver::Resolver;

pub struct PermissionEngine {
    groups: Arc<GroupStore>,
    identities: Arc<IdentityCache>,
    resolver: Resolver,
}

impl PermissionEngine {
    /// Load all groups and build the resolver.
    ///
    /// `authority` is the result of [`authority::discover`]; `None` keeps every
    /// decision local.
    pub async fn start(
        store: Arc<dyn PermissionStore>,
        authority: Option<Arc<dyn ExternalAuthority>>,
        cfg: &settings::Resolver,
    ) -> Result<Self, PermError> {
        let groups = Arc::new(GroupStore::load(store.clone()).await?);
        let identities = Arc::new(IdentityCache::new(store));
        let resolver = Resolver::new(
            groups.clone(),
            identities.clone(),
            authority,
            cfg.max_inheritance_depth,
        );

        info!(
            delegating = resolver.is_delegating(),
            max_depth = cfg.max_inheritance_depth,
            "Permission engine started"
        );

        Ok(Self {
            groups,
            identities,
            resolver,
        })
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn groups(&self) -> &Arc<GroupStore> {
        &self.groups
    }

    pub fn identities(&self) -> &Arc<IdentityCache> {
        &self.identities
    }

    pub fn admin(&self) -> Admin {
        Admin::new(
            self.groups.clone(),
            self.identities.clone(),
            self.resolver.clone(),
        )
    }

    /// Warm the cache for a joining player and record their current name.
    pub async fn on_connect(&self, id: Uuid, display_name: &str) {
        if self.resolver.is_delegating() {
            return;
        }
        let identity = self.identities.touch(id, display_name).await;
        debug!(identity = %id, primary_group = %identity.primary_group, "Player connected");
    }

    pub fn on_disconnect(&self, id: Uuid) {
        self.identities.evict(id);
    }

    /// Drop every cached identity. Nothing is written; all saves are synchronous.
    pub fn shutdown(&self) {
        let resident = self.identities.resident_count();
        self.identities.clear();
        info!(resident, "Permission engine stopped");
    }
}
