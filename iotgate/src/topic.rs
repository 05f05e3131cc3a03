//! Topic grammar and ACL evaluation.
//!
//! Exactly two topic shapes are recognised:
//!
//! - `/device/{client_id}/s` (device outbound) and `/device/{client_id}/r` (device inbound)
//! - `/group/{name}/s` (group outbound) and `/group/{name}/r` (group inbound)
//!
//! Everything else is denied. Device topics are decided from the topic string
//! alone; group topics need a membership lookup, which [`evaluate`] hands back
//! to the caller as [`Verdict::RequireGroup`].

use crate::types::Action;

/// Direction of a channel, as seen from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `/s`: the device sends.
    Send,
    /// `/r`: the device receives.
    Receive,
}

/// A topic matching one of the two recognised shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic<'a> {
    Device { client_id: &'a str, direction: Direction },
    Group { name: &'a str, direction: Direction },
}

impl<'a> Topic<'a> {
    /// Parse a topic string. Returns `None` for anything outside the grammar.
    pub fn parse(topic: &'a str) -> Option<Self> {
        let rest = topic.strip_prefix('/')?;
        let mut parts = rest.split('/');
        let kind = parts.next()?;
        let id = parts.next()?;
        let direction = match parts.next()? {
            "s" => Direction::Send,
            "r" => Direction::Receive,
            _ => return None,
        };
        if parts.next().is_some() || !is_literal_segment(id) {
            return None;
        }
        match kind {
            "device" => Some(Topic::Device { client_id: id, direction }),
            "group" => Some(Topic::Group { name: id, direction }),
            _ => None,
        }
    }
}

/// Non-empty and free of MQTT wildcards.
fn is_literal_segment(s: &str) -> bool {
    !s.is_empty() && !s.contains(['+', '#'])
}

/// Inbound channel of a device: `/device/{client_id}/r`.
pub fn device_inbound(client_id: &str) -> String {
    format!("/device/{}/r", client_id)
}

/// Outbound channel of a device: `/device/{client_id}/s`.
#[cfg(test)]
fn device_outbound(client_id: &str) -> String {
    format!("/device/{}/s", client_id)
}

/// Inbound channel of a group: `/group/{name}/r`.
pub fn group_inbound(name: &str) -> String {
    format!("/group/{}/r", name)
}

/// Outbound channel of a group: `/group/{name}/s`.
#[cfg(test)]
fn group_outbound(name: &str) -> String {
    format!("/group/{}/s", name)
}

/// Outcome of the pure part of the ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict<'a> {
    Allow,
    Deny,
    /// Allowed iff the client is a member of the named group.
    RequireGroup(&'a str),
}

/// Evaluate `action` on `topic` for `client_id`.
pub fn evaluate<'a>(client_id: &str, topic: &'a str, action: Action) -> Verdict<'a> {
    match Topic::parse(topic) {
        Some(Topic::Device { client_id: owner, direction }) => {
            let own_direction = match action {
                Action::Publish => Direction::Send,
                Action::Subscribe => Direction::Receive,
            };
            if direction == own_direction && owner == client_id {
                Verdict::Allow
            } else {
                Verdict::Deny
            }
        }
        Some(Topic::Group { name, .. }) => Verdict::RequireGroup(name),
        None => Verdict::Deny,
    }
}
