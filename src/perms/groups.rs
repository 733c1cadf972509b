use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::errors::PermError;
use crate::perms::types::{normalize_group_name, normalize_node, Group, DEFAULT_GROUP};
use crate::storage::{GroupRow, PermissionStore};

/// Authoritative in-memory set of groups, written through to the store.
///
/// Lookups never touch the store. Every mutation persists first and only then
/// republishes the group, so a failed write leaves the previous definition in place.
/// Writers of the same group hold its write lock from read to publish.
pub struct GroupStore {
    store: Arc<dyn PermissionStore>,
    groups: DashMap<String, Arc<Group>>,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl GroupStore {
    /// Load every group from the store, creating the `default` group if it is missing.
    pub async fn load(store: Arc<dyn PermissionStore>) -> Result<Self, PermError> {
        let rows = store.load_groups().await?;
        let mut permissions = store.load_group_permissions().await?;

        let groups = DashMap::new();
        for row in rows {
            let perms = permissions.remove(&row.name).unwrap_or_default();
            let group = row.into_group(perms);
            groups.insert(group.name.clone(), Arc::new(group));
        }

        let this = Self {
            store,
            groups,
            write_locks: DashMap::new(),
        };

        if !this.exists(DEFAULT_GROUP) {
            this.save(Group::new(DEFAULT_GROUP)).await?;
            info!("Created missing `default` group");
        }

        info!(groups = this.groups.len(), "Loaded permission groups");
        Ok(this)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Group>> {
        self.groups
            .get(&normalize_group_name(name))
            .map(|entry| entry.value().clone())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.groups.contains_key(&normalize_group_name(name))
    }

    /// All groups, heaviest first.
    pub fn list(&self) -> Vec<Arc<Group>> {
        let mut groups: Vec<Arc<Group>> = self
            .groups
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        groups.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.name.cmp(&b.name)));
        groups
    }

    pub async fn create(&self, name: &str) -> Result<Arc<Group>, PermError> {
        let key = normalize_group_name(name);
        if key.is_empty() {
            return Err(PermError::Other("group name must not be empty".into()));
        }

        let lock = self.write_lock(&key);
        let _guard = lock.lock().await;

        if self.exists(&key) {
            return Err(PermError::AlreadyExists(key));
        }

        let group = Group::new(name);
        self.persist(&group).await?;

        let group = Arc::new(group);
        match self.groups.entry(key.clone()) {
            Entry::Occupied(_) => Err(PermError::AlreadyExists(key)),
            Entry::Vacant(slot) => {
                slot.insert(group.clone());
                info!(group = %key, "Created group");
                Ok(group)
            }
        }
    }

    pub async fn delete(&self, name: &str) -> Result<(), PermError> {
        let key = normalize_group_name(name);
        if key == DEFAULT_GROUP {
            return Err(PermError::Protected(key));
        }

        let lock = self.write_lock(&key);
        let _guard = lock.lock().await;

        if !self.exists(&key) {
            return Err(PermError::NotFound(key));
        }

        self.store.delete_group(&key).await.map_err(|e| {
            error!(group = %key, error = %e, "Failed to delete group");
            e
        })?;
        self.groups.remove(&key);

        info!(group = %key, "Deleted group");
        Ok(())
    }

    fn write_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.write_locks.entry(key.to_string()).or_default().clone()
    }

    /// Persist the group row and its full permission set, then publish it.
    pub async fn save(&self, group: Group) -> Result<Arc<Group>, PermError> {
        let lock = self.write_lock(&group.name);
        let _guard = lock.lock().await;
        self.persist_and_publish(group).await
    }

    async fn persist_and_publish(&self, group: Group) -> Result<Arc<Group>, PermError> {
        self.persist(&group).await?;
        let group = Arc::new(group);
        self.groups.insert(group.name.clone(), group.clone());
        Ok(group)
    }

    async fn persist(&self, group: &Group) -> Result<(), PermError> {
        let result = async {
            self.store.upsert_group(&GroupRow::from_group(group)).await?;
            self.store
                .replace_group_permissions(&group.name, &group.permissions)
                .await
        }
        .await;

        if let Err(e) = &result {
            error!(group = %group.name, error = %e, "Failed to persist group");
        }
        result
    }

    /// Apply `f` to a copy of the named group and save it.
    pub async fn update<F>(&self, name: &str, f: F) -> Result<Arc<Group>, PermError>
    where
        F: FnOnce(&mut Group),
    {
        self.try_update(name, |g| {
            f(g);
            Ok(())
        })
        .await
    }

    /// Like [`GroupStore::update`], but `f` may reject the change before anything is
    /// written.
    async fn try_update<F>(&self, name: &str, f: F) -> Result<Arc<Group>, PermError>
    where
        F: FnOnce(&mut Group) -> Result<(), PermError>,
    {
        let key = normalize_group_name(name);
        let lock = self.write_lock(&key);
        let _guard = lock.lock().await;

        let current = self.get(&key).ok_or(PermError::NotFound(key))?;
        let mut group = current.as_ref().clone();
        f(&mut group)?;
        self.persist_and_publish(group).await
    }

    pub async fn set_prefix(&self, name: &str, prefix: &str) -> Result<Arc<Group>, PermError> {
        self.update(name, |g| g.prefix = prefix.to_string()).await
    }

    pub async fn set_suffix(&self, name: &str, suffix: &str) -> Result<Arc<Group>, PermError> {
        self.update(name, |g| g.suffix = suffix.to_string()).await
    }

    pub async fn set_weight(&self, name: &str, weight: i64) -> Result<Arc<Group>, PermError> {
        self.update(name, |g| g.weight = weight).await
    }

    pub async fn set_display_name(
        &self,
        name: &str,
        display_name: &str,
    ) -> Result<Arc<Group>, PermError> {
        self.update(name, |g| g.display_name = display_name.to_string())
            .await
    }

    pub async fn set_permission(
        &self,
        name: &str,
        node: &str,
        value: bool,
    ) -> Result<Arc<Group>, PermError> {
        let node = normalize_node(node);
        if node.is_empty() {
            return Err(PermError::Other("permission node must not be empty".into()));
        }
        self.update(name, |g| {
            g.permissions.insert(node, value);
        })
        .await
    }

    pub async fn unset_permission(&self, name: &str, node: &str) -> Result<Arc<Group>, PermError> {
        let node = normalize_node(node);
        self.update(name, |g| {
            g.permissions.remove(&node);
        })
        .await
    }

    /// Point `name` at a new parent, or clear it with `None`.
    ///
    /// Rejects parents that do not exist and parents whose own chain leads back to
    /// `name`.
    pub async fn set_parent(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<Arc<Group>, PermError> {
        let parent = parent.map(normalize_group_name);
        if let Some(parent_key) = &parent {
            if !self.exists(parent_key) {
                return Err(PermError::NotFound(parent_key.clone()));
            }
        }

        self.try_update(name, |g| {
            if let Some(parent_key) = &parent {
                self.check_cycle(&g.name, parent_key)?;
            }
            g.parent = parent;
            Ok(())
        })
        .await
    }

    fn check_cycle(&self, name: &str, parent: &str) -> Result<(), PermError> {
        let mut chain = vec![name.to_string()];
        let mut seen = HashSet::new();
        let mut current = Some(parent.to_string());

        while let Some(group) = current {
            chain.push(group.clone());
            if group == name {
                return Err(PermError::CyclicInheritance(chain.join(" -> ")));
            }
            // A loop elsewhere in the chain never reaches `name`
            if !seen.insert(group.clone()) {
                break;
            }
            current = self.get(&group).and_then(|g| g.parent.clone());
        }
        Ok(())
    }
}
