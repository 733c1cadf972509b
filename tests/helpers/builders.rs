use paladin::perms::types::Group;
use paladin::perms::GroupStore;
use std::sync::Arc;

/// Builder for creating test groups
pub struct GroupBuilder {
    name: String,
    prefix: String,
    suffix: String,
    weight: i64,
    parent: Option<String>,
    permissions: Vec<(String, bool)>,
}

impl GroupBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            prefix: String::new(),
            suffix: String::new(),
            weight: 0,
            parent: None,
            permissions: Vec::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    pub fn with_suffix(mut self, suffix: &str) -> Self {
        self.suffix = suffix.to_string();
        self
    }

    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    pub fn inherits(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn grant(mut self, node: &str) -> Self {
        self.permissions.push((node.to_string(), true));
        self
    }

    pub fn deny(mut self, node: &str) -> Self {
        self.permissions.push((node.to_string(), false));
        self
    }

    pub async fn create(self, groups: &GroupStore) -> Arc<Group> {
        groups
            .create(&self.name)
            .await
            .expect("Failed to create test group");

        let permissions = self.permissions;
        let (prefix, suffix, weight) = (self.prefix, self.suffix, self.weight);
        groups
            .update(&self.name, |g| {
                g.prefix = prefix;
                g.suffix = suffix;
                g.weight = weight;
                for (node, value) in permissions {
                    g.permissions.insert(node, value);
                }
            })
            .await
            .expect("Failed to update test group");

        match self.parent {
            Some(parent) => groups
                .set_parent(&self.name, Some(&parent))
                .await
                .expect("Failed to set test group parent"),
            None => groups.get(&self.name).expect("test group missing"),
        }
    }
}
