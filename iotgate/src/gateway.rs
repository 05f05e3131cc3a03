//! Gateway: the hook points a transport engine drives, plus the polling and
//! provisioning surface.

use std::fmt::Display;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Authorizer;
use crate::cache::{DeviceCache, Sweeper};
use crate::config::Config;
use crate::directory::{Directory, DirectoryError};
use crate::error::{Error, Rejection, Result};
use crate::forward::{Forwarded, Forwarder};
use crate::types::{
    CacheStats, ConnectionInfo, ConnectionMode, Device, ForwardMessage, Group, SessionHandle,
    Transport,
};

/// Device cache, authorization and forwarding behind one handle.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use bytes::Bytes;
/// use giztoy_iotgate::{Config, Gateway, MemoryDirectory};
///
/// #[tokio::main]
/// async fn main() -> giztoy_iotgate::Result<()> {
///     let transport = |topic: &str, payload: Bytes| -> giztoy_iotgate::Result<()> {
///         println!("{} <- {} bytes", topic, payload.len());
///         Ok(())
///     };
///     let gateway = Gateway::new(
///         Config::default(),
///         Arc::new(MemoryDirectory::new()),
///         Arc::new(transport),
///     )?;
///     gateway.start()?;
///
///     let device = gateway.register("uuid-1", "factory-token")?;
///     let device = gateway.issue_credentials(&device.auth_key)?;
///     println!("issued client id {:?}", device.client_id);
///
///     gateway.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct Gateway {
    config: Config,
    cache: Arc<DeviceCache>,
    directory: Arc<dyn Directory>,
    authorizer: Authorizer,
    forwarder: Forwarder,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Gateway {
    /// Create a gateway. The expiry sweep does not run until [`start`](Self::start).
    pub fn new(config: Config, directory: Arc<dyn Directory>, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(DeviceCache::from_config(&config));
        let authorizer = Authorizer::new(cache.clone(), directory.clone(), config.message.max_length);
        let forwarder = Forwarder::new(cache.clone(), transport);

        Ok(Self {
            config,
            cache,
            directory,
            authorizer,
            forwarder,
            sweeper: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<DeviceCache> {
        &self.cache
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spawn the expiry sweep on the current tokio runtime.
    pub fn start(&self) -> Result<()> {
        tokio::runtime::Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;
        let mut sweeper = self.sweeper.lock();
        if sweeper.as_ref().is_some_and(|s| !s.is_finished()) {
            return Err(Error::AlreadyRunning);
        }
        *sweeper = Some(self.cache.spawn_sweeper(self.config.cache.sweep_interval));
        Ok(())
    }

    /// Stop the expiry sweep and wait for it to exit.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.shutdown().await;
            info!("Gateway stopped");
        }
    }

    // ------------------------------------------------------------------
    // Transport hooks
    // ------------------------------------------------------------------

    /// Connect hook.
    pub fn authenticate(&self, client_id: &str, username: &str, password: &[u8]) -> Result<Device> {
        self.authorizer.authenticate(client_id, username, password)
    }

    /// Publish hook. A rejection that disconnects also closes the session.
    pub fn authorize_publish(&self, client_id: &str, topic: &str, payload: &[u8]) -> Result<()> {
        let result = self.authorizer.authorize_publish(client_id, topic, payload);
        self.enforce(client_id, result)
    }

    /// Subscribe hook. A rejection that disconnects also closes the session.
    pub fn authorize_subscribe(&self, client_id: &str, topic: &str) -> Result<()> {
        let result = self.authorizer.authorize_subscribe(client_id, topic);
        self.enforce(client_id, result)
    }

    fn enforce(&self, client_id: &str, result: Result<()>) -> Result<()> {
        if let Err(Error::Rejected(rejection)) = &result {
            if rejection.disconnects() {
                self.force_disconnect(client_id, rejection);
            }
        }
        result
    }

    fn force_disconnect(&self, client_id: &str, reason: &Rejection) {
        match self.cache.get_session(client_id) {
            Some(session) => {
                warn!("Disconnecting {}: {}", client_id, reason);
                session.close();
                self.cache.set_offline_session(client_id, &session);
            }
            None => debug!("No session to close for {}", client_id),
        }
    }

    /// Session established.
    pub fn on_connect(&self, client_id: &str, session: SessionHandle) {
        self.cache.set_online(client_id, session);
        info!("Client {} connected", client_id);
    }

    /// Session ended, whichever session was bound.
    pub fn on_disconnect(&self, client_id: &str) {
        self.cache.set_offline(client_id);
        info!("Client {} disconnected", client_id);
    }

    /// Session ended. Ignored if a newer session has taken over `client_id`.
    pub fn on_disconnect_session(&self, client_id: &str, session: &SessionHandle) {
        if self.cache.set_offline_session(client_id, session) {
            info!("Client {} disconnected", client_id);
        } else {
            debug!("Stale disconnect for {} ignored", client_id);
        }
    }

    /// Session failed.
    pub fn on_client_error(&self, client_id: &str, error: &dyn Display) {
        warn!("Client {} error: {}", client_id, error);
        self.cache.set_offline(client_id);
    }

    /// Accepted publish. Forwarding problems are logged, never returned.
    pub fn on_publish(&self, client_id: &str, topic: &str, payload: &[u8]) -> Forwarded {
        match self.forwarder.forward(client_id, topic, payload) {
            Ok(forwarded) => forwarded,
            Err(e) => {
                warn!("Dropped message from {} on {}: {}", client_id, topic, e);
                Forwarded::default()
            }
        }
    }

    // ------------------------------------------------------------------
    // Polling surface
    // ------------------------------------------------------------------

    /// Take the staged messages of a polling device.
    pub fn drain(&self, client_id: &str) -> Vec<ForwardMessage> {
        self.cache.touch_polled(client_id);
        let messages = self.cache.drain_staged(client_id);
        debug!("Client {} polled {} messages", client_id, messages.len());
        messages
    }

    pub fn set_mode(&self, client_id: &str, mode: ConnectionMode) {
        self.cache.set_mode(client_id, mode);
        debug!("Client {} switched to {} mode", client_id, mode);
    }

    pub fn mode(&self, client_id: &str) -> ConnectionMode {
        self.cache.get_mode(client_id)
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // ------------------------------------------------------------------
    // Provisioning
    // ------------------------------------------------------------------

    /// Register a device by hardware identity.
    ///
    /// Returns the existing record when `uuid` is known and `token` matches;
    /// a different token is refused.
    pub fn register(&self, uuid: &str, token: &str) -> Result<Device> {
        let device = match self.directory.find_device_by_uuid(uuid)? {
            Some(device) if device.token == token => device,
            Some(_) => {
                warn!("Registration refused for {}: token mismatch", uuid);
                return Err(Rejection::BadCredentials.into());
            }
            None => {
                let auth_key = Uuid::new_v4().to_string();
                let device = self.directory.create_device(uuid, token, &auth_key)?;
                info!("Registered device {} (id {})", uuid, device.id);
                device
            }
        };
        self.cache.upsert_device_by_auth_key(&device.auth_key, device.clone());
        Ok(device)
    }

    /// Mint fresh connection credentials for the device owning `auth_key`.
    pub fn issue_credentials(&self, auth_key: &str) -> Result<Device> {
        let existing = match self.cache.get_device_by_auth_key(auth_key) {
            Some(device) => Some(device),
            None => self.directory.find_device_by_auth_key(auth_key)?,
        };
        let Some(existing) = existing else {
            warn!("Credentials refused: unknown auth key");
            return Err(Rejection::BadCredentials.into());
        };

        let info = ConnectionInfo {
            client_id: Uuid::new_v4().simple().to_string(),
            username: Uuid::new_v4().simple().to_string(),
            password: Uuid::new_v4().simple().to_string(),
            iot_token: Uuid::new_v4().to_string(),
        };
        self.directory.update_device_connection(auth_key, &info)?;

        if let Some(old) = existing.client_id.as_deref() {
            self.cache.remove_device(old, auth_key);
        }

        let device = self
            .directory
            .find_device_by_auth_key(auth_key)?
            .ok_or_else(|| DirectoryError::NotFound(format!("auth key {}", auth_key)))?;
        self.cache.upsert_device(&info.client_id, device.clone());
        self.cache.upsert_device_by_auth_key(auth_key, device.clone());

        info!("Issued credentials {} for device {}", info.client_id, device.uuid);
        Ok(device)
    }

    /// Add a device to a group in the directory, creating the group if needed.
    ///
    /// The cache picks the membership up on the next connect or
    /// [`refresh_groups`](Self::refresh_groups).
    pub fn join_group(&self, client_id: &str, group: &str) -> Result<Group> {
        let device = self.lookup(client_id)?;
        let group = self.directory.create_group(group)?;
        self.directory.add_device_to_group(device.id, group.id)?;
        debug!("Client {} joined group {}", client_id, group.name);
        Ok(group)
    }

    /// Reload the cached groups of `client_id` from the directory.
    pub fn refresh_groups(&self, client_id: &str) -> Result<Vec<String>> {
        let device = self.lookup(client_id)?;
        let groups = self.directory.list_groups_for_device(device.id)?;
        self.cache
            .set_groups(client_id, groups.into_iter().map(|g| g.name));
        Ok(self.cache.groups_of(client_id))
    }

    /// Drop a device from the cache. The directory record is kept.
    pub fn remove_device(&self, client_id: &str) {
        let auth_key = self
            .cache
            .get_device(client_id)
            .map(|d| d.auth_key)
            .unwrap_or_default();
        self.cache.remove_device(client_id, &auth_key);
        info!("Removed {} from cache", client_id);
    }

    fn lookup(&self, client_id: &str) -> Result<Device> {
        if let Some(device) = self.cache.get_device(client_id) {
            return Ok(device);
        }
        self.directory
            .find_device_by_client_id(client_id)?
            .ok_or_else(|| DirectoryError::NotFound(format!("client {}", client_id)).into())
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("running", &self.sweeper.lock().is_some())
            .finish_non_exhaustive()
    }
}
