use crate::perms::types::{normalize_node, PermissionMap};

/// Decide `permission` against a single permission map.
///
/// An exact entry wins. Otherwise every proper prefix of the node is tried as a
/// wildcard (`a.*`, then `a.b.*`, ...) from the broadest to the narrowest, and the
/// first entry found decides. `None` means the map does not decide the node; it is
/// not a denial. The grant-all key `*` is left to the caller.
pub fn check(map: &PermissionMap, permission: &str) -> Option<bool> {
    if map.is_empty() {
        return None;
    }

    let node = normalize_node(permission);
    if let Some(value) = map.get(&node) {
        return Some(*value);
    }

    for (idx, _) in node.match_indices('.') {
        let wildcard = format!("{}.*", &node[..idx]);
        if let Some(value) = map.get(&wildcard) {
            return Some(*value);
        }
    }

    None
}
