use crate::perms::types::{normalize_group_name, normalize_node, Group};
use crate::perms::GroupStore;
use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Group definition from JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDefinition {
    /// Group name (case-insensitive unique key)
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub suffix: Option<String>,
    #[serde(default)]
    pub weight: Option<i64>,
    /// Parent group. When absent the group keeps its current parent.
    #[serde(default)]
    pub parent: Option<String>,
    /// Nodes to set on the group; nodes not listed are left alone
    #[serde(default)]
    pub permissions: HashMap<String, bool>,
}

/// Root structure of the groups JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupsFile {
    pub groups: Vec<GroupDefinition>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Sync groups from a JSON file into the group store (idempotent)
pub async fn sync_groups_from_file(groups: &GroupStore, file_path: &Path) -> Result<SyncReport> {
    tracing::info!("Loading groups from {}", file_path.display());

    let content = fs::read_to_string(file_path)
        .into_diagnostic()
        .map_err(|e| {
            miette::miette!(
                "Failed to read groups file at '{}': {}",
                file_path.display(),
                e
            )
        })?;

    let groups_file: GroupsFile = serde_json::from_str(&content)
        .into_diagnostic()
        .map_err(|e| {
            miette::miette!(
                "Failed to parse groups JSON file: {}\n\nExpected format:\n{{\n  \"groups\": [\n    {{\n      \"name\": \"moderator\",\n      \"prefix\": \"[Mod] \",\n      \"weight\": 50,\n      \"parent\": \"default\",\n      \"permissions\": {{\n        \"vc.kick\": true\n      }}\n    }}\n  ]\n}}",
                e
            )
        })?;

    sync_groups(groups, &groups_file).await
}

/// Apply every definition, then every parent link, so definitions may reference
/// groups that appear later in the file.
pub async fn sync_groups(groups: &GroupStore, file: &GroupsFile) -> Result<SyncReport> {
    tracing::info!("Found {} group(s) in file", file.groups.len());

    let mut results = Vec::with_capacity(file.groups.len());
    for group_def in &file.groups {
        results.push(sync_group(groups, group_def).await?);
    }

    for (group_def, result) in file.groups.iter().zip(results.iter_mut()) {
        let Some(parent) = &group_def.parent else {
            continue;
        };
        let parent = normalize_group_name(parent);
        let current = groups
            .get(&group_def.name)
            .and_then(|g| g.parent.clone());
        if current.as_deref() != Some(parent.as_str()) {
            groups.set_parent(&group_def.name, Some(&parent)).await?;
            if *result == SyncResult::Unchanged {
                *result = SyncResult::Updated;
            }
        }
    }

    let mut report = SyncReport::default();
    for result in results {
        match result {
            SyncResult::Created => report.created += 1,
            SyncResult::Updated => report.updated += 1,
            SyncResult::Unchanged => report.unchanged += 1,
        }
    }

    tracing::info!(
        "Group sync complete: {} created, {} updated, {} unchanged",
        report.created,
        report.updated,
        report.unchanged
    );

    Ok(report)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncResult {
    Created,
    Updated,
    Unchanged,
}

/// Sync a single group, leaving its parent for the second pass
async fn sync_group(groups: &GroupStore, group_def: &GroupDefinition) -> Result<SyncResult> {
    let existing = groups.get(&group_def.name);

    let mut desired = match &existing {
        Some(group) => group.as_ref().clone(),
        None => Group::new(&group_def.name),
    };
    if let Some(display_name) = &group_def.display_name {
        desired.display_name = display_name.clone();
    }
    if let Some(prefix) = &group_def.prefix {
        desired.prefix = prefix.clone();
    }
    if let Some(suffix) = &group_def.suffix {
        desired.suffix = suffix.clone();
    }
    if let Some(weight) = group_def.weight {
        desired.weight = weight;
    }
    for (node, value) in &group_def.permissions {
        desired.permissions.insert(normalize_node(node), *value);
    }

    let result = match existing {
        None => {
            tracing::info!("Creating group: {}", desired.name);
            groups.save(desired).await?;
            SyncResult::Created
        }
        Some(current) if *current != desired => {
            tracing::info!("Updating group: {}", desired.name);
            groups.save(desired).await?;
            SyncResult::Updated
        }
        Some(_) => SyncResult::Unchanged,
    };

    if !group_def.permissions.is_empty() {
        tracing::debug!(
            "Synced {} permissions for group {}",
            group_def.permissions.len(),
            group_def.name
        );
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perms::test_utils::TestDb;
    use crate::perms::types::DEFAULT_GROUP;
    use tempfile::TempDir;

    const SEED: &str = r#"{
  "groups": [
    {
      "name": "Moderator",
      "prefix": "[Mod] ",
      "weight": 50,
      "parent": "helper",
      "permissions": { "VC.Kick": true }
    },
    {
      "name": "helper",
      "permissions": { "vc.mute": true }
    },
    {
      "name": "default",
      "permissions": { "vc.chat": true }
    }
  ]
}"#;

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let test_db = TestDb::new().await;
        let groups = GroupStore::load(test_db.store()).await.unwrap();
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("groups.json");
        fs::write(&path, SEED).expect("Failed to write seed file");

        let report = sync_groups_from_file(&groups, &path).await.unwrap();
        assert_eq!(
            report,
            SyncReport {
                created: 2,
                updated: 1,
                unchanged: 0
            }
        );

        let moderator = groups.get("moderator").unwrap();
        assert_eq!(moderator.display_name, "Moderator");
        assert_eq!(moderator.prefix, "[Mod] ");
        assert_eq!(moderator.weight, 50);
        assert_eq!(moderator.parent.as_deref(), Some("helper"));
        assert_eq!(moderator.permissions.get("vc.kick"), Some(&true));
        assert_eq!(
            groups.get("helper").unwrap().parent.as_deref(),
            Some(DEFAULT_GROUP)
        );
        assert_eq!(
            groups.get(DEFAULT_GROUP).unwrap().permissions.get("vc.chat"),
            Some(&true)
        );

        let report = sync_groups_from_file(&groups, &path).await.unwrap();
        assert_eq!(
            report,
            SyncReport {
                created: 0,
                updated: 0,
                unchanged: 3
            }
        );
    }

    #[tokio::test]
    async fn test_sync_rejects_cyclic_parents() {
        let test_db = TestDb::new().await;
        let groups = GroupStore::load(test_db.store()).await.unwrap();

        let file: GroupsFile = serde_json::from_str(
            r#"{ "groups": [
                { "name": "a", "parent": "b" },
                { "name": "b", "parent": "a" }
            ] }"#,
        )
        .unwrap();

        assert!(sync_groups(&groups, &file).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let test_db = TestDb::new().await;
        let groups = GroupStore::load(test_db.store()).await.unwrap();

        let err = sync_groups_from_file(&groups, Path::new("/nonexistent/groups.json"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read groups file"));
    }
}
