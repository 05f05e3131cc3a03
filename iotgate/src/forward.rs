//! Forwarding of accepted publishes to devices and groups.

use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};

use crate::cache::DeviceCache;
use crate::error::{Error, Result};
use crate::topic::{self, Direction, Topic};
use crate::types::{ForwardMessage, Transport};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceEnvelope {
    to_device: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupEnvelope {
    to_group: String,
    data: serde_json::Value,
}

/// Where a forwarded message went.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Forwarded {
    /// Topic the message was pushed to, if the push succeeded.
    pub published: Option<String>,
    /// Polling devices the message was staged for, sorted.
    pub staged: Vec<String>,
}

/// Forwarding engine.
#[derive(Clone)]
pub struct Forwarder {
    cache: Arc<DeviceCache>,
    transport: Arc<dyn Transport>,
}

impl Forwarder {
    pub fn new(cache: Arc<DeviceCache>, transport: Arc<dyn Transport>) -> Self {
        Self { cache, transport }
    }

    /// Forward a publish from `client_id` that was already authorized.
    ///
    /// Only `/device/{x}/s` and `/group/{g}/s` carry forwarding envelopes;
    /// anything else forwards nothing.
    pub fn forward(&self, client_id: &str, topic: &str, payload: &[u8]) -> Result<Forwarded> {
        match Topic::parse(topic) {
            Some(Topic::Device {
                direction: Direction::Send,
                ..
            }) => self.forward_to_device(client_id, payload),
            Some(Topic::Group {
                direction: Direction::Send,
                ..
            }) => self.forward_to_group(client_id, payload),
            _ => {
                trace!("Nothing to forward for {} on {}", client_id, topic);
                Ok(Forwarded::default())
            }
        }
    }

    fn forward_to_device(&self, client_id: &str, payload: &[u8]) -> Result<Forwarded> {
        let envelope: DeviceEnvelope = parse(payload)?;
        if envelope.to_device.is_empty() {
            return Err(Error::MalformedEnvelope("empty toDevice".to_string()));
        }
        check_data(&envelope.data)?;

        let target = envelope.to_device;
        let message = ForwardMessage::from_device(client_id, envelope.data);

        if self.cache.is_polling(&target) {
            self.cache.stage(&target, message);
            debug!("Staged message from {} for polling device {}", client_id, target);
            return Ok(Forwarded {
                published: None,
                staged: vec![target],
            });
        }

        let published = self.publish(&topic::device_inbound(&target), &message);
        if published.is_some() {
            debug!("Forwarded message from {} to device {}", client_id, target);
        }
        Ok(Forwarded {
            published,
            staged: Vec::new(),
        })
    }

    fn forward_to_group(&self, client_id: &str, payload: &[u8]) -> Result<Forwarded> {
        let envelope: GroupEnvelope = parse(payload)?;
        if envelope.to_group.is_empty() {
            return Err(Error::MalformedEnvelope("empty toGroup".to_string()));
        }
        check_data(&envelope.data)?;

        let group = envelope.to_group;
        if !self.cache.is_in_group(client_id, &group) {
            debug!("Dropped group message from {}: not a member of {}", client_id, group);
            return Ok(Forwarded::default());
        }

        let message = ForwardMessage::from_group(&group, client_id, envelope.data);

        let mut staged: Vec<String> = self
            .cache
            .members_of(&group)
            .into_iter()
            .filter(|member| member != client_id && self.cache.is_polling(member))
            .collect();
        staged.sort();
        for member in &staged {
            self.cache.stage(member, message.clone());
        }

        let published = self.publish(&topic::group_inbound(&group), &message);
        debug!(
            "Forwarded message from {} to group {} ({} staged)",
            client_id,
            group,
            staged.len()
        );
        Ok(Forwarded { published, staged })
    }

    /// Push `message` over the transport. Failures are logged and not retried.
    fn publish(&self, topic: &str, message: &ForwardMessage) -> Option<String> {
        let result = serde_json::to_vec(message)
            .map_err(|e| Error::Delivery(e.to_string()))
            .and_then(|body| self.transport.publish(topic, Bytes::from(body)));
        match result {
            Ok(()) => Some(topic.to_string()),
            Err(e) => {
                warn!("Failed to publish to {}: {}", topic, e);
                None
            }
        }
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder").finish_non_exhaustive()
    }
}

fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| Error::MalformedEnvelope(e.to_string()))
}

fn check_data(data: &serde_json::Value) -> Result<()> {
    // Only null counts as missing; 0, "" and false are forwarded as data.
    if data.is_null() {
        return Err(Error::MalformedEnvelope("missing data".to_string()));
    }
    Ok(())
}
