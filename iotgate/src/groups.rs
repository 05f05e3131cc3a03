//! Bidirectional group membership index.

use std::collections::{HashMap, HashSet};

/// Group membership kept twice: client → groups and group → members.
///
/// Every mutation updates both sides, so callers only need one lock around
/// the whole index for the two maps to stay mutually consistent.
#[derive(Debug, Default)]
pub struct GroupIndex {
    by_client: HashMap<String, HashSet<String>>,
    by_group: HashMap<String, HashSet<String>>,
}

impl GroupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the group set of `client_id`.
    pub fn set<I, S>(&mut self, client_id: &str, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.remove(client_id);

        let groups: HashSet<String> = groups.into_iter().map(Into::into).collect();
        if groups.is_empty() {
            return;
        }
        for group in &groups {
            self.by_group
                .entry(group.clone())
                .or_default()
                .insert(client_id.to_string());
        }
        self.by_client.insert(client_id.to_string(), groups);
    }

    /// Drop every membership of `client_id`, returning the groups it held.
    pub fn remove(&mut self, client_id: &str) -> Option<HashSet<String>> {
        let groups = self.by_client.remove(client_id)?;
        for group in &groups {
            if let Some(members) = self.by_group.get_mut(group) {
                members.remove(client_id);
                if members.is_empty() {
                    self.by_group.remove(group);
                }
            }
        }
        Some(groups)
    }

    /// Reverse-index membership test.
    pub fn contains(&self, client_id: &str, group: &str) -> bool {
        self.by_group
            .get(group)
            .is_some_and(|members| members.contains(client_id))
    }

    /// Members of `group`.
    pub fn members(&self, group: &str) -> HashSet<String> {
        self.by_group.get(group).cloned().unwrap_or_default()
    }

    /// Groups of `client_id`, sorted.
    pub fn groups_of(&self, client_id: &str) -> Vec<String> {
        let mut groups: Vec<String> = self
            .by_client
            .get(client_id)
            .map(|g| g.iter().cloned().collect())
            .unwrap_or_default();
        groups.sort();
        groups
    }

    /// Verify that the reverse index is exactly the transpose of the forward map.
    pub fn check_consistency(&self) -> Result<(), String> {
        for (client, groups) in &self.by_client {
            if groups.is_empty() {
                return Err(format!("client {} has an empty group set", client));
            }
            for group in groups {
                if !self.contains(client, group) {
                    return Err(format!("{} missing from reverse index of {}", client, group));
                }
            }
        }
        for (group, members) in &self.by_group {
            if members.is_empty() {
                return Err(format!("group {} has an empty member set", group));
            }
            for client in members {
                let held = self.by_client.get(client).is_some_and(|g| g.contains(group));
                if !held {
                    return Err(format!("{} listed under {} but does not hold it", client, group));
                }
            }
        }
        Ok(())
    }
}
