//! In-memory directory implementation.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;

use super::{Directory, DirectoryError, DirectoryResult};
use crate::types::{ConnectionInfo, Device, Group};

#[derive(Default)]
struct Tables {
    devices: BTreeMap<u64, Device>,
    groups: BTreeMap<u64, Group>,
    /// (device_id, group_id)
    memberships: BTreeSet<(u64, u64)>,
    next_device_id: u64,
    next_group_id: u64,
}

impl Tables {
    fn find_device(&self, pred: impl Fn(&Device) -> bool) -> Option<Device> {
        self.devices.values().find(|d| pred(d)).cloned()
    }
}

/// A directory held entirely in memory.
#[derive(Default)]
pub struct MemoryDirectory {
    tables: RwLock<Tables>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Directory for MemoryDirectory {
    fn find_device_by_client_id(&self, client_id: &str) -> DirectoryResult<Option<Device>> {
        Ok(self
            .tables
            .read()
            .find_device(|d| d.client_id.as_deref() == Some(client_id)))
    }

    fn find_device_by_auth_key(&self, auth_key: &str) -> DirectoryResult<Option<Device>> {
        Ok(self.tables.read().find_device(|d| d.auth_key == auth_key))
    }

    fn find_device_by_uuid(&self, uuid: &str) -> DirectoryResult<Option<Device>> {
        Ok(self.tables.read().find_device(|d| d.uuid == uuid))
    }

    fn create_device(&self, uuid: &str, token: &str, auth_key: &str) -> DirectoryResult<Device> {
        let mut tables = self.tables.write();
        if tables
            .find_device(|d| d.uuid == uuid || d.auth_key == auth_key)
            .is_some()
        {
            return Err(DirectoryError::Conflict(format!("device {} already exists", uuid)));
        }

        tables.next_device_id += 1;
        let device = Device {
            id: tables.next_device_id,
            uuid: uuid.to_string(),
            token: token.to_string(),
            auth_key: auth_key.to_string(),
            client_id: None,
            username: None,
            password: None,
            iot_token: None,
        };
        tables.devices.insert(device.id, device.clone());
        Ok(device)
    }

    fn update_device_connection(&self, auth_key: &str, info: &ConnectionInfo) -> DirectoryResult<()> {
        let mut tables = self.tables.write();
        let device = tables
            .devices
            .values_mut()
            .find(|d| d.auth_key == auth_key)
            .ok_or_else(|| DirectoryError::NotFound(format!("auth key {}", auth_key)))?;

        device.client_id = Some(info.client_id.clone());
        device.username = Some(info.username.clone());
        device.password = Some(info.password.clone());
        device.iot_token = Some(info.iot_token.clone());
        Ok(())
    }

    fn create_group(&self, name: &str) -> DirectoryResult<Group> {
        let mut tables = self.tables.write();
        if let Some(group) = tables.groups.values().find(|g| g.name == name) {
            return Ok(group.clone());
        }

        tables.next_group_id += 1;
        let group = Group {
            id: tables.next_group_id,
            name: name.to_string(),
        };
        tables.groups.insert(group.id, group.clone());
        Ok(group)
    }

    fn find_group_by_name(&self, name: &str) -> DirectoryResult<Option<Group>> {
        Ok(self
            .tables
            .read()
            .groups
            .values()
            .find(|g| g.name == name)
            .cloned())
    }

    fn add_device_to_group(&self, device_id: u64, group_id: u64) -> DirectoryResult<()> {
        let mut tables = self.tables.write();
        if !tables.devices.contains_key(&device_id) {
            return Err(DirectoryError::NotFound(format!("device {}", device_id)));
        }
        if !tables.groups.contains_key(&group_id) {
            return Err(DirectoryError::NotFound(format!("group {}", group_id)));
        }
        tables.memberships.insert((device_id, group_id));
        Ok(())
    }

    fn list_groups_for_device(&self, device_id: u64) -> DirectoryResult<Vec<Group>> {
        let tables = self.tables.read();
        Ok(tables
            .memberships
            .range((device_id, 0)..=(device_id, u64::MAX))
            .filter_map(|(_, group_id)| tables.groups.get(group_id).cloned())
            .collect())
    }

    fn list_devices_in_group(&self, group_id: u64) -> DirectoryResult<Vec<Device>> {
        let tables = self.tables.read();
        Ok(tables
            .memberships
            .iter()
            .filter(|(_, g)| *g == group_id)
            .filter_map(|(device_id, _)| tables.devices.get(device_id).cloned())
            .collect())
    }

    fn is_device_in_group(&self, device_id: u64, group_name: &str) -> DirectoryResult<bool> {
        let tables = self.tables.read();
        Ok(tables
            .groups
            .values()
            .find(|g| g.name == group_name)
            .is_some_and(|g| tables.memberships.contains(&(device_id, g.id))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::conformance;

    #[test]
    fn test_devices() {
        conformance::devices(&MemoryDirectory::new());
    }

    #[test]
    fn test_groups() {
        conformance::groups(&MemoryDirectory::new());
    }
}
