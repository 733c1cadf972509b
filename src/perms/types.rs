use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Name of the fallback group every identity ends up in.
pub const DEFAULT_GROUP: &str = "default";

/// Key that, when set to `true`, grants every node regardless of the request.
pub const GRANT_ALL: &str = "*";

/// Normalized permission node -> explicit allow (`true`) or deny (`false`).
pub type PermissionMap = HashMap<String, bool>;

/// Lowercase and trim a permission node.
pub fn normalize_node(node: &str) -> String {
    node.trim().to_lowercase()
}

/// Group names are case-insensitive keys.
pub fn normalize_group_name(name: &str) -> String {
    name.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Lowercased unique key
    pub name: String,
    pub display_name: String,
    pub prefix: String,
    pub suffix: String,
    pub weight: i64,
    /// Name of the group this one inherits from
    pub parent: Option<String>,
    pub permissions: PermissionMap,
}

impl Group {
    /// A fresh, empty group. Every group except `default` itself inherits from `default`.
    pub fn new(name: &str) -> Self {
        let key = normalize_group_name(name);
        let parent = if key == DEFAULT_GROUP {
            None
        } else {
            Some(DEFAULT_GROUP.to_string())
        };
        Self {
            name: key,
            display_name: name.trim().to_string(),
            prefix: String::new(),
            suffix: String::new(),
            weight: 0,
            parent,
            permissions: PermissionMap::new(),
        }
    }

    pub fn grants_all(&self) -> bool {
        self.permissions.get(GRANT_ALL).copied().unwrap_or(false)
    }
}

/// Membership of an identity in a non-primary group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub group: String,
    /// Unix timestamp (seconds) after which the membership no longer applies
    pub expires_at: Option<i64>,
}

impl Membership {
    pub fn permanent(group: &str) -> Self {
        Self {
            group: normalize_group_name(group),
            expires_at: None,
        }
    }

    pub fn until(group: &str, expires_at: i64) -> Self {
        Self {
            group: normalize_group_name(group),
            expires_at: Some(expires_at),
        }
    }

    pub fn is_active(&self, now: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    /// Last known player name
    pub display_name: String,
    pub primary_group: String,
    pub additional_groups: Vec<Membership>,
    /// Empty means "defer to groups"
    pub prefix: String,
    pub suffix: String,
    pub permissions: PermissionMap,
}

impl Identity {
    /// The identity a player gets before anything was ever stored for them.
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            display_name: String::new(),
            primary_group: DEFAULT_GROUP.to_string(),
            additional_groups: Vec::new(),
            prefix: String::new(),
            suffix: String::new(),
            permissions: PermissionMap::new(),
        }
    }

    pub fn grants_all(&self) -> bool {
        self.permissions.get(GRANT_ALL).copied().unwrap_or(false)
    }

    pub fn active_memberships(&self, now: i64) -> impl Iterator<Item = &Membership> {
        self.additional_groups.iter().filter(move |m| m.is_active(now))
    }

    pub fn membership(&self, group: &str) -> Option<&Membership> {
        let key = normalize_group_name(group);
        self.additional_groups.iter().find(|m| m.group == key)
    }
}

// ---------- API request/response types ----------

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckRequest {
    pub identity: Uuid,
    /// e.g. "vc.home.set"
    pub permission: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResponse {
    pub allowed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetaRequest {
    pub identity: Uuid,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MetaResponse {
    pub prefix: String,
    pub suffix: String,
    pub primary_group: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_node("  VC.Home.Set "), "vc.home.set");
        assert_eq!(normalize_group_name("VIP"), "vip");
    }

    #[test]
    fn test_new_group_inherits_default() {
        let g = Group::new("Moderator");
        assert_eq!(g.name, "moderator");
        assert_eq!(g.display_name, "Moderator");
        assert_eq!(g.parent.as_deref(), Some(DEFAULT_GROUP));
        assert_eq!(g.weight, 0);
        assert!(g.prefix.is_empty());

        // default never points at itself
        assert!(Group::new("default").parent.is_none());
    }

    #[test]
    fn test_grant_all_requires_true() {
        let mut g = Group::new("admin");
        assert!(!g.grants_all());
        g.permissions.insert(GRANT_ALL.into(), false);
        assert!(!g.grants_all());
        g.permissions.insert(GRANT_ALL.into(), true);
        assert!(g.grants_all());
    }

    #[test]
    fn test_membership_expiry() {
        assert!(Membership::permanent("vip").is_active(i64::MAX));
        let m = Membership::until("vip", 1_000);
        assert!(m.is_active(999));
        assert!(!m.is_active(1_000));
        assert!(!m.is_active(2_000));
    }

    #[test]
    fn test_active_memberships_filter() {
        let mut identity = Identity::new(Uuid::new_v4());
        identity.additional_groups = vec![
            Membership::permanent("builder"),
            Membership::until("vip", 100),
            Membership::until("event", 500),
        ];

        let active: Vec<_> = identity
            .active_memberships(200)
            .map(|m| m.group.as_str())
            .collect();
        assert_eq!(active, vec!["builder", "event"]);
        assert!(identity.membership("VIP").is_some());
        assert!(identity.membership("staff").is_none());
    }
}
