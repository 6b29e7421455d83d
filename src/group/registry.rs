//! Explicit registry of connection groups.
//!
//! Passed into whatever owns the session lifecycle instead of living as
//! process-wide mutable state: constructors receive the registry they
//! should use, and session teardown calls [`GroupRegistry::close_all`].

use std::collections::HashMap;
use std::sync::Mutex;

use crate::group::ConnectionGroup;

/// Registry of connection groups keyed by deployment id.
#[derive(Default)]
pub struct GroupRegistry {
    groups: Mutex<HashMap<String, ConnectionGroup>>,
}

impl GroupRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a group under its deployment id, returning any group it
    /// replaced.
    pub fn insert(&self, group: ConnectionGroup) -> Option<ConnectionGroup> {
        self.groups
            .lock()
            .expect("registry lock")
            .insert(group.id().to_string(), group)
    }

    /// Look up a group by deployment id.
    pub fn get(&self, deployment_id: &str) -> Option<ConnectionGroup> {
        self.groups
            .lock()
            .expect("registry lock")
            .get(deployment_id)
            .cloned()
    }

    /// Remove a group. The caller is responsible for disconnecting it.
    pub fn remove(&self, deployment_id: &str) -> Option<ConnectionGroup> {
        self.groups
            .lock()
            .expect("registry lock")
            .remove(deployment_id)
    }

    /// Registered deployment ids.
    pub fn deployment_ids(&self) -> Vec<String> {
        self.groups
            .lock()
            .expect("registry lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Number of registered groups.
    pub fn len(&self) -> usize {
        self.groups.lock().expect("registry lock").len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.groups.lock().expect("registry lock").is_empty()
    }

    /// Disconnect and drop every registered group. Used at session
    /// teardown.
    pub async fn close_all(&self) {
        let groups: Vec<ConnectionGroup> = {
            let mut guard = self.groups.lock().expect("registry lock");
            guard.drain().map(|(_, group)| group).collect()
        };
        for group in groups {
            group.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{GroupConfig, GroupStatus};
    use crate::profile::CertProfile;

    fn make_group(id: &str) -> ConnectionGroup {
        let (group, _events) = ConnectionGroup::new(
            GroupConfig::new(id, format!("wss://{id}.swarm.local/channel")),
            CertProfile::pin_only("dGVzdA=="),
        );
        group
    }

    #[test]
    fn insert_get_remove() {
        let registry = GroupRegistry::new();
        assert!(registry.is_empty());

        registry.insert(make_group("node-1"));
        registry.insert(make_group("node-2"));
        assert_eq!(registry.len(), 2);
        assert!(registry.get("node-1").is_some());
        assert!(registry.get("node-3").is_none());

        let removed = registry.remove("node-1").unwrap();
        assert_eq!(removed.id(), "node-1");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn insert_replaces_same_id() {
        let registry = GroupRegistry::new();
        assert!(registry.insert(make_group("node-1")).is_none());
        let replaced = registry.insert(make_group("node-1")).unwrap();
        assert_eq!(replaced.id(), "node-1");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn close_all_drains_and_idles_groups() {
        let registry = GroupRegistry::new();
        let group = make_group("node-1");
        registry.insert(group.clone());

        registry.close_all().await;
        assert!(registry.is_empty());
        assert_eq!(group.status(), GroupStatus::Idle);
    }
}
