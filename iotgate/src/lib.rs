//! Device cache, topic ACL and message forwarding for a multi-tenant IoT
//! MQTT broker.
//!
//! The crate decides which client may connect, which topics it may publish or
//! subscribe to, and how a message addressed to a device or a group is
//! delivered: pushed over the live transport, or staged for devices that poll.
//!
//! ## Components
//!
//! - [`DeviceCache`]: identities, sessions, rate state, group membership with
//!   a reverse index, connection modes, staged messages
//! - [`Authorizer`]: connect / publish / subscribe decisions
//! - [`Forwarder`]: device and group fan-out
//! - [`Directory`]: durable device and group store ([`MemoryDirectory`],
//!   [`RedbDirectory`])
//! - [`Gateway`]: the hook points a transport engine drives
//!
//! ## Topics
//!
//! | Topic | Publish | Subscribe |
//! |-------|---------|-----------|
//! | `/device/{client_id}/s` | owner | - |
//! | `/device/{client_id}/r` | - | owner |
//! | `/group/{name}/s` | members | members |
//! | `/group/{name}/r` | members | members |
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use giztoy_iotgate::{Config, ConnectionMode, Gateway, RedbDirectory};
//!
//! #[tokio::main]
//! async fn main() -> giztoy_iotgate::Result<()> {
//!     let config = Config::load("iotgate.yaml")?;
//!     let directory = Arc::new(RedbDirectory::open("devices.redb")?);
//!     let transport = |topic: &str, payload: Bytes| -> giztoy_iotgate::Result<()> {
//!         println!("{}: {:?}", topic, payload);
//!         Ok(())
//!     };
//!
//!     let gateway = Gateway::new(config, directory, Arc::new(transport))?;
//!     gateway.start()?;
//!
//!     // Called by the broker for each connect and publish.
//!     gateway.authenticate("client-1", "user", b"pass")?;
//!     gateway.authorize_publish("client-1", "/device/client-1/s", br#"{"toDevice":"client-2","data":1}"#)?;
//!     gateway.on_publish("client-1", "/device/client-1/s", br#"{"toDevice":"client-2","data":1}"#);
//!
//!     // Called by the polling endpoint.
//!     gateway.set_mode("client-2", ConnectionMode::Polling);
//!     let messages = gateway.drain("client-2");
//!     println!("{} staged", messages.len());
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```

mod auth;
mod cache;
mod config;
pub mod directory;
mod error;
mod forward;
mod gateway;
mod groups;
mod staging;
pub mod topic;
mod types;

pub use auth::Authorizer;
pub use cache::{DeviceCache, Sweeper};
pub use config::{CacheConfig, Config, MessageConfig};
pub use directory::{Directory, DirectoryError, DirectoryResult, MemoryDirectory, RedbDirectory};
pub use error::{Error, ReasonCode, Rejection, Result};
pub use forward::{Forwarded, Forwarder};
pub use gateway::Gateway;
pub use groups::GroupIndex;
pub use types::{
    Action, CacheStats, ConnectionInfo, ConnectionMode, Device, ForwardMessage, Group, Session,
    SessionHandle, Transport,
};
