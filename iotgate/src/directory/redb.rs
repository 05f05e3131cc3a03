//! Redb-based persistent directory implementation.
//!
//! Rows are stored as JSON under numeric ids; secondary keys (`uuid:`,
//! `auth:`, `client:`) map back to the device id. Memberships are a set of
//! `(device_id, group_id)` keys so a device's groups are one range scan.

use std::fmt::Display;
use std::path::Path;

use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{Directory, DirectoryError, DirectoryResult};
use crate::types::{ConnectionInfo, Device, Group};

const DEVICES: TableDefinition<u64, &[u8]> = TableDefinition::new("devices");
const DEVICE_KEYS: TableDefinition<&str, u64> = TableDefinition::new("device_keys");
const GROUPS: TableDefinition<u64, &[u8]> = TableDefinition::new("groups");
const GROUP_NAMES: TableDefinition<&str, u64> = TableDefinition::new("group_names");
const MEMBERSHIPS: TableDefinition<(u64, u64), ()> = TableDefinition::new("memberships");
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

fn storage(e: impl Display) -> DirectoryError {
    DirectoryError::Storage(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> DirectoryResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| DirectoryError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DirectoryResult<T> {
    serde_json::from_slice(bytes).map_err(|e| DirectoryError::Serialization(e.to_string()))
}

fn uuid_key(uuid: &str) -> String {
    format!("uuid:{}", uuid)
}

fn auth_key(auth_key: &str) -> String {
    format!("auth:{}", auth_key)
}

fn client_key(client_id: &str) -> String {
    format!("client:{}", client_id)
}

fn load<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
    id: u64,
) -> DirectoryResult<Option<T>> {
    match table.get(id).map_err(storage)? {
        Some(row) => Ok(Some(decode(row.value())?)),
        None => Ok(None),
    }
}

fn next_id(sequences: &mut Table<'_, &'static str, u64>, name: &str) -> DirectoryResult<u64> {
    let next = sequences
        .get(name)
        .map_err(storage)?
        .map(|v| v.value())
        .unwrap_or(0)
        + 1;
    sequences.insert(name, next).map_err(storage)?;
    Ok(next)
}

/// A persistent directory backed by redb.
pub struct RedbDirectory {
    db: Database,
}

impl RedbDirectory {
    /// Open or create a directory database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> DirectoryResult<Self> {
        let db = Database::create(path).map_err(storage)?;

        // Create every table up front so read transactions never miss one.
        let tx = db.begin_write().map_err(storage)?;
        {
            tx.open_table(DEVICES).map_err(storage)?;
            tx.open_table(DEVICE_KEYS).map_err(storage)?;
            tx.open_table(GROUPS).map_err(storage)?;
            tx.open_table(GROUP_NAMES).map_err(storage)?;
            tx.open_table(MEMBERSHIPS).map_err(storage)?;
            tx.open_table(SEQUENCES).map_err(storage)?;
        }
        tx.commit().map_err(storage)?;

        Ok(Self { db })
    }

    fn device_by_key(&self, key: &str) -> DirectoryResult<Option<Device>> {
        let tx = self.db.begin_read().map_err(storage)?;
        let keys = tx.open_table(DEVICE_KEYS).map_err(storage)?;
        let Some(id) = keys.get(key).map_err(storage)?.map(|v| v.value()) else {
            return Ok(None);
        };
        let devices = tx.open_table(DEVICES).map_err(storage)?;
        load(&devices, id)
    }
}

impl Directory for RedbDirectory {
    fn find_device_by_client_id(&self, client_id: &str) -> DirectoryResult<Option<Device>> {
        self.device_by_key(&client_key(client_id))
    }

    fn find_device_by_auth_key(&self, key: &str) -> DirectoryResult<Option<Device>> {
        self.device_by_key(&auth_key(key))
    }

    fn find_device_by_uuid(&self, uuid: &str) -> DirectoryResult<Option<Device>> {
        self.device_by_key(&uuid_key(uuid))
    }

    fn create_device(&self, uuid: &str, token: &str, key: &str) -> DirectoryResult<Device> {
        let tx = self.db.begin_write().map_err(storage)?;
        let device = {
            let mut keys = tx.open_table(DEVICE_KEYS).map_err(storage)?;
            let uuid_k = uuid_key(uuid);
            let auth_k = auth_key(key);
            if keys.get(uuid_k.as_str()).map_err(storage)?.is_some()
                || keys.get(auth_k.as_str()).map_err(storage)?.is_some()
            {
                return Err(DirectoryError::Conflict(format!("device {} already exists", uuid)));
            }

            let mut sequences = tx.open_table(SEQUENCES).map_err(storage)?;
            let id = next_id(&mut sequences, "device")?;
            let device = Device {
                id,
                uuid: uuid.to_string(),
                token: token.to_string(),
                auth_key: key.to_string(),
                client_id: None,
                username: None,
                password: None,
                iot_token: None,
            };

            let mut devices = tx.open_table(DEVICES).map_err(storage)?;
            devices
                .insert(id, encode(&device)?.as_slice())
                .map_err(storage)?;
            keys.insert(uuid_k.as_str(), id).map_err(storage)?;
            keys.insert(auth_k.as_str(), id).map_err(storage)?;
            device
        };
        tx.commit().map_err(storage)?;
        Ok(device)
    }

    fn update_device_connection(&self, key: &str, info: &ConnectionInfo) -> DirectoryResult<()> {
        let tx = self.db.begin_write().map_err(storage)?;
        {
            let mut keys = tx.open_table(DEVICE_KEYS).map_err(storage)?;
            let mut devices = tx.open_table(DEVICES).map_err(storage)?;

            let not_found = || DirectoryError::NotFound(format!("auth key {}", key));
            let id = keys
                .get(auth_key(key).as_str())
                .map_err(storage)?
                .map(|v| v.value())
                .ok_or_else(not_found)?;
            let mut device: Device = load(&devices, id)?.ok_or_else(not_found)?;

            if let Some(old) = device.client_id.as_deref() {
                let old_key = client_key(old);
                let owner = keys.get(old_key.as_str()).map_err(storage)?.map(|v| v.value());
                if owner == Some(id) {
                    keys.remove(old_key.as_str()).map_err(storage)?;
                }
            }

            device.client_id = Some(info.client_id.clone());
            device.username = Some(info.username.clone());
            device.password = Some(info.password.clone());
            device.iot_token = Some(info.iot_token.clone());

            devices
                .insert(id, encode(&device)?.as_slice())
                .map_err(storage)?;
            keys.insert(client_key(&info.client_id).as_str(), id)
                .map_err(storage)?;
        }
        tx.commit().map_err(storage)?;
        Ok(())
    }

    fn create_group(&self, name: &str) -> DirectoryResult<Group> {
        let tx = self.db.begin_write().map_err(storage)?;
        let group = {
            let mut names = tx.open_table(GROUP_NAMES).map_err(storage)?;
            let mut groups = tx.open_table(GROUPS).map_err(storage)?;

            let existing = names.get(name).map_err(storage)?.map(|v| v.value());
            if let Some(id) = existing {
                let group: Group = load(&groups, id)?
                    .ok_or_else(|| DirectoryError::Storage(format!("dangling group name {}", name)))?;
                return Ok(group);
            }

            let mut sequences = tx.open_table(SEQUENCES).map_err(storage)?;
            let id = next_id(&mut sequences, "group")?;
            let group = Group {
                id,
                name: name.to_string(),
            };
            groups.insert(id, encode(&group)?.as_slice()).map_err(storage)?;
            names.insert(name, id).map_err(storage)?;
            group
        };
        tx.commit().map_err(storage)?;
        Ok(group)
    }

    fn find_group_by_name(&self, name: &str) -> DirectoryResult<Option<Group>> {
        let tx = self.db.begin_read().map_err(storage)?;
        let names = tx.open_table(GROUP_NAMES).map_err(storage)?;
        let Some(id) = names.get(name).map_err(storage)?.map(|v| v.value()) else {
            return Ok(None);
        };
        let groups = tx.open_table(GROUPS).map_err(storage)?;
        load(&groups, id)
    }

    fn add_device_to_group(&self, device_id: u64, group_id: u64) -> DirectoryResult<()> {
        let tx = self.db.begin_write().map_err(storage)?;
        {
            let devices = tx.open_table(DEVICES).map_err(storage)?;
            if devices.get(device_id).map_err(storage)?.is_none() {
                return Err(DirectoryError::NotFound(format!("device {}", device_id)));
            }
            let groups = tx.open_table(GROUPS).map_err(storage)?;
            if groups.get(group_id).map_err(storage)?.is_none() {
                return Err(DirectoryError::NotFound(format!("group {}", group_id)));
            }
            let mut memberships = tx.open_table(MEMBERSHIPS).map_err(storage)?;
            memberships
                .insert((device_id, group_id), ())
                .map_err(storage)?;
        }
        tx.commit().map_err(storage)?;
        Ok(())
    }

    fn list_groups_for_device(&self, device_id: u64) -> DirectoryResult<Vec<Group>> {
        let tx = self.db.begin_read().map_err(storage)?;
        let memberships = tx.open_table(MEMBERSHIPS).map_err(storage)?;
        let groups = tx.open_table(GROUPS).map_err(storage)?;

        let mut result = Vec::new();
        for entry in memberships
            .range((device_id, 0u64)..=(device_id, u64::MAX))
            .map_err(storage)?
        {
            let (key, _) = entry.map_err(storage)?;
            let (_, group_id) = key.value();
            if let Some(group) = load(&groups, group_id)? {
                result.push(group);
            }
        }
        Ok(result)
    }

    fn list_devices_in_group(&self, group_id: u64) -> DirectoryResult<Vec<Device>> {
        let tx = self.db.begin_read().map_err(storage)?;
        let memberships = tx.open_table(MEMBERSHIPS).map_err(storage)?;
        let devices = tx.open_table(DEVICES).map_err(storage)?;

        let mut result = Vec::new();
        for entry in memberships.iter().map_err(storage)? {
            let (key, _) = entry.map_err(storage)?;
            let (device_id, g) = key.value();
            if g != group_id {
                continue;
            }
            if let Some(device) = load(&devices, device_id)? {
                result.push(device);
            }
        }
        Ok(result)
    }

    fn is_device_in_group(&self, device_id: u64, group_name: &str) -> DirectoryResult<bool> {
        let tx = self.db.begin_read().map_err(storage)?;
        let names = tx.open_table(GROUP_NAMES).map_err(storage)?;
        let Some(group_id) = names.get(group_name).map_err(storage)?.map(|v| v.value()) else {
            return Ok(false);
        };
        let memberships = tx.open_table(MEMBERSHIPS).map_err(storage)?;
        Ok(memberships
            .get((device_id, group_id))
            .map_err(storage)?
            .is_some())
    }
}
