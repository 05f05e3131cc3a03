//! Persistent device directory.
//!
//! The directory is the durable source of truth for device records and group
//! membership. The gateway consults it on cache misses: when a connecting
//! device is not cached, when loading a device's groups, and when the cache
//! says a device is not in a group (double-check before denying).
//!
//! Two implementations are provided: [`MemoryDirectory`] for tests and
//! embedding, and [`RedbDirectory`] for an on-disk store.

pub mod memory;
pub mod redb;

use std::fmt;

use thiserror::Error;

use crate::types::{ConnectionInfo, Device, Group};

pub use memory::MemoryDirectory;
pub use redb::RedbDirectory;

/// Errors that can occur in directory operations.
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("directory: not found: {0}")]
    NotFound(String),

    #[error("directory: conflict: {0}")]
    Conflict(String),

    #[error("directory: storage error: {0}")]
    Storage(String),

    #[error("directory: serialization error: {0}")]
    Serialization(String),
}

/// Result type for directory operations.
pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Durable device and group store.
pub trait Directory: Send + Sync {
    fn find_device_by_client_id(&self, client_id: &str) -> DirectoryResult<Option<Device>>;

    fn find_device_by_auth_key(&self, auth_key: &str) -> DirectoryResult<Option<Device>>;

    fn find_device_by_uuid(&self, uuid: &str) -> DirectoryResult<Option<Device>>;

    /// Create a device. `uuid` and `auth_key` must both be unused.
    fn create_device(&self, uuid: &str, token: &str, auth_key: &str) -> DirectoryResult<Device>;

    /// Write connection credentials for the device owning `auth_key`.
    fn update_device_connection(&self, auth_key: &str, info: &ConnectionInfo) -> DirectoryResult<()>;

    /// Create a group, or return the existing one with that name.
    fn create_group(&self, name: &str) -> DirectoryResult<Group>;

    fn find_group_by_name(&self, name: &str) -> DirectoryResult<Option<Group>>;

    /// Add a device to a group. Adding an existing member is a no-op.
    fn add_device_to_group(&self, device_id: u64, group_id: u64) -> DirectoryResult<()>;

    fn list_groups_for_device(&self, device_id: u64) -> DirectoryResult<Vec<Group>>;

    fn list_devices_in_group(&self, group_id: u64) -> DirectoryResult<Vec<Device>>;

    fn is_device_in_group(&self, device_id: u64, group_name: &str) -> DirectoryResult<bool>;
}

impl fmt::Debug for dyn Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Directory {{ ... }}")
    }
}
