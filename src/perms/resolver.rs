use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::perms::authority::ExternalAuthority;
use crate::perms::groups::GroupStore;
use crate::perms::identities::IdentityCache;
use crate::perms::matcher;
use crate::perms::types::{normalize_node, Group, Identity, DEFAULT_GROUP};

/// Answers permission and decoration queries for identities.
///
/// Every entry point is total: storage or authority failures degrade to a denial or
/// an empty decoration and are logged, never returned.
#[derive(Clone)]
pub struct Resolver {
    groups: Arc<GroupStore>,
    identities: Arc<IdentityCache>,
    authority: Option<Arc<dyn ExternalAuthority>>,
    max_depth: usize,
}

impl Resolver {
    pub fn new(
        groups: Arc<GroupStore>,
        identities: Arc<IdentityCache>,
        authority: Option<Arc<dyn ExternalAuthority>>,
        max_depth: usize,
    ) -> Self {
        Self {
            groups,
            identities,
            authority,
            max_depth,
        }
    }

    /// True when an external authority answers every query.
    pub fn is_delegating(&self) -> bool {
        self.authority.is_some()
    }

    pub async fn has_permission(&self, id: Uuid, permission: &str) -> bool {
        if let Some(authority) = &self.authority {
            return match authority.check(id, permission).await {
                Ok(answer) => answer.as_bool(),
                Err(e) => {
                    warn!(identity = %id, permission, authority = authority.name(), error = %e, "Authority check failed, denying");
                    false
                }
            };
        }

        let identity = self.identities.get_or_load(id).await;
        self.resolve(&identity, permission)
    }

    pub async fn get_prefix(&self, id: Uuid) -> String {
        if let Some(authority) = &self.authority {
            return match authority.prefix(id).await {
                Ok(prefix) => prefix.unwrap_or_default(),
                Err(e) => {
                    warn!(identity = %id, error = %e, "Authority prefix lookup failed");
                    String::new()
                }
            };
        }

        let identity = self.identities.get_or_load(id).await;
        self.prefix_at(&identity, Utc::now().timestamp())
    }

    pub async fn get_suffix(&self, id: Uuid) -> String {
        if let Some(authority) = &self.authority {
            return match authority.suffix(id).await {
                Ok(suffix) => suffix.unwrap_or_default(),
                Err(e) => {
                    warn!(identity = %id, error = %e, "Authority suffix lookup failed");
                    String::new()
                }
            };
        }

        let identity = self.identities.get_or_load(id).await;
        self.suffix_at(&identity, Utc::now().timestamp())
    }

    /// The identity's primary group, or `default` when it is unset or no longer exists.
    pub async fn get_primary_group(&self, id: Uuid) -> String {
        if let Some(authority) = &self.authority {
            return match authority.primary_group(id).await {
                Ok(group) => group.unwrap_or_else(|| DEFAULT_GROUP.to_string()),
                Err(e) => {
                    warn!(identity = %id, error = %e, "Authority primary group lookup failed");
                    DEFAULT_GROUP.to_string()
                }
            };
        }

        let identity = self.identities.get_or_load(id).await;
        self.primary_group_of(&identity)
            .map(|g| g.name.clone())
            .unwrap_or_else(|| DEFAULT_GROUP.to_string())
    }

    /// Resolve against the built-in data only.
    pub fn resolve(&self, identity: &Identity, permission: &str) -> bool {
        self.resolve_at(identity, permission, Utc::now().timestamp())
    }

    pub fn resolve_at(&self, identity: &Identity, permission: &str, now: i64) -> bool {
        let node = normalize_node(permission);

        if let Some(value) = matcher::check(&identity.permissions, &node) {
            return value;
        }
        if identity.grants_all() {
            return true;
        }

        let mut visited = HashSet::new();
        for candidate in self.candidate_groups(identity, now) {
            if let Some(value) = self.climb(candidate, &node, &mut visited) {
                return value;
            }
        }

        false
    }

    /// Primary group first, then active additional groups heaviest first.
    ///
    /// Groups that no longer exist are skipped and each group appears once.
    pub fn candidate_groups(&self, identity: &Identity, now: i64) -> Vec<Arc<Group>> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        if let Some(primary) = self.primary_group_of(identity) {
            seen.insert(primary.name.clone());
            candidates.push(primary);
        }

        let mut additional: Vec<Arc<Group>> = identity
            .active_memberships(now)
            .filter_map(|m| self.groups.get(&m.group))
            .filter(|g| seen.insert(g.name.clone()))
            .collect();
        additional.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.name.cmp(&b.name)));

        candidates.extend(additional);
        candidates
    }

    fn primary_group_of(&self, identity: &Identity) -> Option<Arc<Group>> {
        if !identity.primary_group.is_empty() {
            if let Some(group) = self.groups.get(&identity.primary_group) {
                return Some(group);
            }
        }
        self.groups.get(DEFAULT_GROUP)
    }

    /// Walk from `start` up its parents until a group decides the node.
    ///
    /// `visited` is shared across candidates, so a group reached twice is only
    /// consulted once and a parent loop ends the walk.
    fn climb(&self, start: Arc<Group>, node: &str, visited: &mut HashSet<String>) -> Option<bool> {
        let mut current = Some(start);
        let mut depth = 0;

        while let Some(group) = current {
            if depth >= self.max_depth {
                warn!(group = %group.name, max_depth = self.max_depth, "Inheritance depth limit reached");
                return None;
            }
            if !visited.insert(group.name.clone()) {
                return None;
            }

            if let Some(value) = matcher::check(&group.permissions, node) {
                return Some(value);
            }
            if group.grants_all() {
                return Some(true);
            }

            current = group.parent.as_deref().and_then(|p| self.groups.get(p));
            depth += 1;
        }

        None
    }

    /// Prefix from the built-in data, with memberships judged active at `now`.
    pub fn prefix_at(&self, identity: &Identity, now: i64) -> String {
        self.decoration_at(identity, now, |i| &i.prefix, |g| &g.prefix)
    }

    pub fn suffix_at(&self, identity: &Identity, now: i64) -> String {
        self.decoration_at(identity, now, |i| &i.suffix, |g| &g.suffix)
    }

    fn decoration_at<I, G>(&self, identity: &Identity, now: i64, own: I, of_group: G) -> String
    where
        I: Fn(&Identity) -> &String,
        G: Fn(&Group) -> &String,
    {
        let value = own(identity);
        if !value.is_empty() {
            return value.clone();
        }

        // Candidates only, parents are not consulted
        let candidates = self.candidate_groups(identity, now);
        candidates
            .iter()
            .map(|g| of_group(g.as_ref()))
            .find(|v| !v.is_empty())
            .cloned()
            .unwrap_or_default()
    }
}
