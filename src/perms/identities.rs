use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::errors::PermError;
use crate::perms::types::Identity;
use crate::storage::{IdentityRow, MembershipRow, PermissionStore};

/// Read-through cache of identities.
///
/// Loads happen outside of any map guard. When two tasks miss on the same id at
/// once, both load, the first insert wins and the other copy is dropped.
///
/// Writers of the same identity are serialized by a per-id async mutex held from
/// the read of the current copy until the new copy is published.
pub struct IdentityCache {
    store: Arc<dyn PermissionStore>,
    cache: DashMap<Uuid, Arc<Identity>>,
    write_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl IdentityCache {
    pub fn new(store: Arc<dyn PermissionStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            write_locks: DashMap::new(),
        }
    }

    pub fn cached(&self, id: Uuid) -> Option<Arc<Identity>> {
        self.cache.get(&id).map(|entry| entry.value().clone())
    }

    /// Cached identity, loading it on a miss. A failed load is logged and yields an
    /// empty identity that is not cached, so the next call retries.
    ///
    /// For read paths only; writers use [`IdentityCache::try_get_or_load`].
    pub async fn get_or_load(&self, id: Uuid) -> Arc<Identity> {
        match self.try_get_or_load(id).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(identity = %id, error = %e, "Failed to load identity, using defaults");
                Arc::new(Identity::new(id))
            }
        }
    }

    /// Like [`IdentityCache::get_or_load`] but reports load failures.
    pub async fn try_get_or_load(&self, id: Uuid) -> Result<Arc<Identity>, PermError> {
        if let Some(hit) = self.cached(id) {
            return Ok(hit);
        }

        let loaded = Arc::new(self.load(id).await?);

        match self.cache.entry(id) {
            Entry::Occupied(winner) => {
                debug!(identity = %id, "Concurrent load already cached identity, discarding copy");
                Ok(winner.get().clone())
            }
            Entry::Vacant(slot) => {
                slot.insert(loaded.clone());
                Ok(loaded)
            }
        }
    }

    async fn load(&self, id: Uuid) -> Result<Identity, PermError> {
        let Some(row) = self.store.load_identity(id).await? else {
            return Ok(Identity::new(id));
        };

        let now = Utc::now().timestamp();
        let memberships = self.store.load_identity_groups(id).await?;
        let permissions = self.store.load_identity_permissions(id).await?;

        let (active, expired): (Vec<MembershipRow>, Vec<MembershipRow>) = memberships
            .into_iter()
            .partition(|m| m.expires_at.map_or(true, |at| at > now));

        if !expired.is_empty() {
            match self.store.delete_expired_memberships(now, Some(id)).await {
                Ok(removed) => debug!(identity = %id, removed, "Removed expired memberships"),
                Err(e) => warn!(identity = %id, error = %e, "Failed to remove expired memberships"),
            }
        }

        Ok(row.into_identity(active, permissions))
    }

    fn write_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.write_locks.entry(id).or_default().clone()
    }

    /// Persist every part of the identity, then publish it to the cache.
    pub async fn save(&self, identity: Identity) -> Result<Arc<Identity>, PermError> {
        let lock = self.write_lock(identity.id);
        let _guard = lock.lock().await;
        self.persist_and_publish(identity).await
    }

    async fn persist_and_publish(&self, identity: Identity) -> Result<Arc<Identity>, PermError> {
        let id = identity.id;
        let result = async {
            self.store
                .upsert_identity(&IdentityRow::from_identity(&identity))
                .await?;
            let memberships: Vec<MembershipRow> = identity
                .additional_groups
                .iter()
                .map(MembershipRow::from)
                .collect();
            self.store.replace_identity_groups(id, &memberships).await?;
            self.store
                .replace_identity_permissions(id, &identity.permissions)
                .await
        }
        .await;

        if let Err(e) = result {
            error!(identity = %id, error = %e, "Failed to persist identity");
            return Err(e);
        }

        let identity = Arc::new(identity);
        self.cache.insert(id, identity.clone());
        Ok(identity)
    }

    /// Apply `f` to a copy of the identity and save it.
    ///
    /// Fails without writing anything when the current identity cannot be loaded.
    pub async fn update<F>(&self, id: Uuid, f: F) -> Result<Arc<Identity>, PermError>
    where
        F: FnOnce(&mut Identity),
    {
        let lock = self.write_lock(id);
        let _guard = lock.lock().await;

        let mut identity = self.try_get_or_load(id).await?.as_ref().clone();
        f(&mut identity);
        self.persist_and_publish(identity).await
    }

    /// Record the player's current name if it changed.
    pub async fn touch(&self, id: Uuid, display_name: &str) -> Arc<Identity> {
        let lock = self.write_lock(id);
        let _guard = lock.lock().await;

        let current = match self.try_get_or_load(id).await {
            Ok(current) => current,
            Err(e) => {
                warn!(identity = %id, error = %e, "Failed to load identity, not recording name");
                return Arc::new(Identity::new(id));
            }
        };
        if current.display_name == display_name {
            return current;
        }

        let mut identity = current.as_ref().clone();
        identity.display_name = display_name.to_string();
        match self.persist_and_publish(identity).await {
            Ok(saved) => saved,
            Err(_) => current,
        }
    }

    /// Drop the cached copy without persisting anything.
    pub fn evict(&self, id: Uuid) -> bool {
        // A lock still referenced elsewhere belongs to an in-flight writer
        self.write_locks
            .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);

        let removed = self.cache.remove(&id).is_some();
        if removed {
            debug!(identity = %id, "Evicted identity");
        }
        removed
    }

    pub fn clear(&self) {
        self.cache.clear();
        self.write_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn resident_count(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perms::test_utils::{CountingStore, TestDb};
    use crate::perms::types::{Membership, DEFAULT_GROUP};

    #[tokio::test]
    async fn test_miss_yields_default_identity() {
        let test_db = TestDb::new().await;
        let cache = IdentityCache::new(test_db.store());
        let id = Uuid::new_v4();

        let identity = cache.get_or_load(id).await;
        assert_eq!(identity.id, id);
        assert_eq!(identity.primary_group, DEFAULT_GROUP);
        assert!(identity.permissions.is_empty());
        assert_eq!(cache.resident_count(), 1);
    }

    #[tokio::test]
    async fn test_save_is_visible_immediately() {
        let test_db = TestDb::new().await;
        let cache = IdentityCache::new(test_db.store());
        let id = Uuid::new_v4();

        cache
            .update(id, |i| {
                i.permissions.insert("vc.fly".into(), true);
            })
            .await
            .unwrap();

        let identity = cache.get_or_load(id).await;
        assert_eq!(identity.permissions.get("vc.fly"), Some(&true));
    }

    #[tokio::test]
    async fn test_evict_then_reload_from_store() {
        let test_db = TestDb::new().await;
        let cache = IdentityCache::new(test_db.store());
        let id = Uuid::new_v4();

        cache
            .update(id, |i| {
                i.primary_group = "vip".into();
                i.prefix = "[Mod] ".into();
                i.additional_groups.push(Membership::permanent("builder"));
            })
            .await
            .unwrap();

        assert!(cache.evict(id));
        assert!(!cache.evict(id));
        assert!(cache.cached(id).is_none());

        let identity = cache.get_or_load(id).await;
        assert_eq!(identity.primary_group, "vip");
        assert_eq!(identity.prefix, "[Mod] ");
        assert_eq!(identity.additional_groups, vec![Membership::permanent("builder")]);
    }

    #[tokio::test]
    async fn test_expired_memberships_dropped_on_load() {
        let test_db = TestDb::new().await;
        let store = test_db.store();
        let cache = IdentityCache::new(store.clone());
        let id = Uuid::new_v4();
        let now = Utc::now().timestamp();

        cache
            .update(id, |i| {
                i.additional_groups = vec![
                    Membership::until("vip", now - 60),
                    Membership::until("event", now + 3_600),
                ];
            })
            .await
            .unwrap();
        cache.evict(id);

        let identity = cache.get_or_load(id).await;
        let groups: Vec<&str> = identity
            .additional_groups
            .iter()
            .map(|m| m.group.as_str())
            .collect();
        assert_eq!(groups, vec!["event"]);

        // The expired row is gone from storage as well
        let rows = store.load_identity_groups(id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].group_name, "event");
    }

    #[tokio::test]
    async fn test_touch_updates_display_name() {
        let test_db = TestDb::new().await;
        let store = test_db.store();
        let cache = IdentityCache::new(store.clone());
        let id = Uuid::new_v4();

        let identity = cache.touch(id, "Steve").await;
        assert_eq!(identity.display_name, "Steve");

        let row = store.load_identity(id).await.unwrap().expect("row missing");
        assert_eq!(row.display_name, "Steve");
    }

    #[tokio::test]
    async fn test_concurrent_cold_loads_share_one_resident_copy() {
        let test_db = TestDb::new().await;
        let counting = Arc::new(CountingStore::slow(test_db.store()));
        let cache = IdentityCache::new(counting.clone());
        let id = Uuid::new_v4();

        // Seed a persisted row without warming the cache
        cache
            .update(id, |i| {
                i.permissions.insert("vc.fly".into(), true);
            })
            .await
            .unwrap();
        cache.clear();
        counting.reset();

        let (a, b) = tokio::join!(cache.get_or_load(id), cache.get_or_load(id));

        // Both missed and loaded, only one copy became resident
        assert_eq!(counting.identity_loads(), 2);
        assert_eq!(cache.resident_count(), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.permissions.get("vc.fly"), Some(&true));

        // A later save is seen by both callers' next reads
        cache
            .update(id, |i| {
                i.permissions.insert("vc.fly".into(), false);
            })
            .await
            .unwrap();
        assert_eq!(cache.get_or_load(id).await.permissions.get("vc.fly"), Some(&false));
    }

    #[tokio::test]
    async fn test_failed_load_never_overwrites_stored_identity() {
        let test_db = TestDb::new().await;
        let flaky = Arc::new(CountingStore::slow(test_db.store()));
        let cache = IdentityCache::new(flaky.clone());
        let id = Uuid::new_v4();

        cache
            .update(id, |i| {
                i.primary_group = "vip".into();
                i.prefix = "[VIP] ".into();
                i.permissions.insert("vc.fly".into(), true);
                i.additional_groups.push(Membership::permanent("builder"));
            })
            .await
            .unwrap();
        cache.evict(id);

        // Name recording is skipped when the stored copy cannot be read
        flaky.fail_next_identity_loads(1);
        let seen = cache.touch(id, "Steve").await;
        assert_eq!(seen.primary_group, DEFAULT_GROUP);
        assert_eq!(cache.resident_count(), 0);

        // A mutation reports the failure instead of writing defaults
        flaky.fail_next_identity_loads(1);
        let err = cache
            .update(id, |i| i.suffix = " !".into())
            .await
            .unwrap_err();
        assert!(matches!(err, PermError::Db(_)));

        let after = cache.get_or_load(id).await;
        assert_eq!(after.primary_group, "vip");
        assert_eq!(after.prefix, "[VIP] ");
        assert_eq!(after.suffix, "");
        assert_eq!(after.display_name, "");
        assert_eq!(after.permissions.get("vc.fly"), Some(&true));
        assert_eq!(after.additional_groups, vec![Membership::permanent("builder")]);
    }

    #[tokio::test]
    async fn test_concurrent_updates_keep_both_writes() {
        let test_db = TestDb::new().await;
        let store = test_db.store();
        let cache = IdentityCache::new(store.clone());
        let id = Uuid::new_v4();

        let (a, b) = tokio::join!(
            cache.update(id, |i| {
                i.permissions.insert("vc.a".into(), true);
            }),
            cache.update(id, |i| {
                i.permissions.insert("vc.b".into(), true);
            })
        );
        a.unwrap();
        b.unwrap();

        let cached = cache.get_or_load(id).await;
        assert_eq!(cached.permissions.len(), 2);

        let stored = store.load_identity_permissions(id).await.unwrap();
        assert_eq!(stored.get("vc.a"), Some(&true));
        assert_eq!(stored.get("vc.b"), Some(&true));
    }

    #[tokio::test]
    async fn test_load_failure_is_not_cached() {
        let test_db = TestDb::new().await;
        let failing = Arc::new(CountingStore::failing(test_db.store()));
        let cache = IdentityCache::new(failing.clone());
        let id = Uuid::new_v4();

        let identity = cache.get_or_load(id).await;
        assert_eq!(identity.primary_group, DEFAULT_GROUP);
        assert_eq!(cache.resident_count(), 0);

        // Saving surfaces the failure and leaves the cache alone
        let err = cache.save(Identity::new(id)).await.unwrap_err();
        assert!(matches!(err, PermError::Db(_)));
        assert_eq!(cache.resident_count(), 0);
    }
}
