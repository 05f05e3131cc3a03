//! Connect, publish and subscribe decisions.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::DeviceCache;
use crate::directory::Directory;
use crate::error::{Rejection, Result};
use crate::topic::{self, Verdict};
use crate::types::{Action, Device};

/// Authorization engine.
///
/// Reads from the [`DeviceCache`] and falls back to the [`Directory`] on a
/// miss. No cache lock is held while the directory is called.
#[derive(Debug, Clone)]
pub struct Authorizer {
    cache: Arc<DeviceCache>,
    directory: Arc<dyn Directory>,
    max_length: usize,
}

impl Authorizer {
    pub fn new(cache: Arc<DeviceCache>, directory: Arc<dyn Directory>, max_length: usize) -> Self {
        Self {
            cache,
            directory,
            max_length,
        }
    }

    /// Check connect credentials.
    ///
    /// On success the device and its groups are loaded into the cache. An
    /// unknown device and a credential mismatch are both `BadCredentials`.
    pub fn authenticate(&self, client_id: &str, username: &str, password: &[u8]) -> Result<Device> {
        let device = match self.cache.get_device(client_id) {
            Some(device) => device,
            None => match self.directory.find_device_by_client_id(client_id)? {
                Some(device) => device,
                None => {
                    warn!("Authentication failed for {}: unknown device", client_id);
                    return Err(Rejection::BadCredentials.into());
                }
            },
        };

        if !device.credentials_match(username, password) {
            warn!("Authentication failed for {}: credential mismatch", client_id);
            return Err(Rejection::BadCredentials.into());
        }

        let groups = self.directory.list_groups_for_device(device.id)?;
        self.cache.upsert_device(client_id, device.clone());
        self.cache
            .set_groups(client_id, groups.into_iter().map(|g| g.name));

        debug!("Client {} authenticated", client_id);
        Ok(device)
    }

    /// Decide whether `client_id` may publish `payload` to `topic`.
    ///
    /// Checks run in order: size, rate, authentication, topic ACL.
    pub fn authorize_publish(&self, client_id: &str, topic: &str, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_length {
            warn!(
                "Payload from {} too large: {} > {} bytes",
                client_id,
                payload.len(),
                self.max_length
            );
            return Err(Rejection::PayloadTooLarge {
                len: payload.len(),
                max: self.max_length,
            }
            .into());
        }

        if !self.cache.record_publish(client_id) {
            warn!("Client {} publishing too fast", client_id);
            return Err(Rejection::RateLimited.into());
        }

        let device = self.authenticated(client_id)?;
        self.check_topic(&device, client_id, topic, Action::Publish)?;

        debug!("Client {} may publish to {}", client_id, topic);
        Ok(())
    }

    /// Decide whether `client_id` may subscribe to `topic`.
    pub fn authorize_subscribe(&self, client_id: &str, topic: &str) -> Result<()> {
        let device = self.authenticated(client_id)?;
        self.check_topic(&device, client_id, topic, Action::Subscribe)?;

        debug!("Client {} may subscribe to {}", client_id, topic);
        Ok(())
    }

    fn authenticated(&self, client_id: &str) -> Result<Device> {
        self.cache.get_device(client_id).ok_or_else(|| {
            warn!("Client {} is not authenticated", client_id);
            Rejection::NotAuthenticated.into()
        })
    }

    fn check_topic(&self, device: &Device, client_id: &str, topic: &str, action: Action) -> Result<()> {
        let allowed = match topic::evaluate(client_id, topic, action) {
            Verdict::Allow => true,
            Verdict::Deny => false,
            Verdict::RequireGroup(name) => {
                // A cached "yes" is trusted; a cached "no" is double-checked.
                self.cache.is_in_group(client_id, name)
                    || self.directory.is_device_in_group(device.id, name)?
            }
        };

        if allowed {
            Ok(())
        } else {
            warn!("ACL denied {} from {} to {}", action, client_id, topic);
            Err(Rejection::Forbidden {
                action,
                topic: topic.to_string(),
            }
            .into())
        }
    }
}
