//! Per-device queues of staged messages for polling devices.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::types::ForwardMessage;

#[derive(Debug, Clone)]
struct StagedMessage {
    message: ForwardMessage,
    staged_at: Instant,
}

/// Staged queues with expiry.
///
/// A message is live while `now - staged_at < expire`. Both [`drain`] and
/// [`sweep`] apply that rule, so an expired message is never returned even if
/// no sweep has run since it expired.
///
/// [`drain`]: StagingArea::drain
/// [`sweep`]: StagingArea::sweep
#[derive(Debug)]
pub struct StagingArea {
    queues: HashMap<String, VecDeque<StagedMessage>>,
    expire: Duration,
}

impl StagingArea {
    pub fn new(expire: Duration) -> Self {
        Self {
            queues: HashMap::new(),
            expire,
        }
    }

    /// Append a message to the queue of `client_id`.
    pub fn stage(&mut self, client_id: &str, message: ForwardMessage, now: Instant) {
        self.queues
            .entry(client_id.to_string())
            .or_default()
            .push_back(StagedMessage { message, staged_at: now });
    }

    /// Detach the queue of `client_id` and return its live messages in order.
    pub fn drain(&mut self, client_id: &str, now: Instant) -> Vec<ForwardMessage> {
        let Some(queue) = self.queues.remove(client_id) else {
            return Vec::new();
        };
        queue
            .into_iter()
            .filter(|m| now.duration_since(m.staged_at) < self.expire)
            .map(|m| m.message)
            .collect()
    }

    /// Drop expired messages everywhere. Returns how many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expire = self.expire;
        let mut dropped = 0;
        self.queues.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|m| now.duration_since(m.staged_at) < expire);
            dropped += before - queue.len();
            !queue.is_empty()
        });
        dropped
    }

    /// Messages currently held for `client_id`, expired ones included.
    pub fn pending(&self, client_id: &str) -> usize {
        self.queues.get(client_id).map_or(0, VecDeque::len)
    }

    /// Messages currently held across all queues.
    pub fn total(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Number of non-empty queues.
    #[cfg(test)]
    fn queue_count(&self) -> usize {
        self.queues.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(n: i64) -> ForwardMessage {
        ForwardMessage::from_device("D9", json!(n))
    }

    #[test]
    fn test_drain_is_exactly_once() {
        let now = Instant::now();
        let mut area = StagingArea::new(Duration::from_secs(60));
        area.stage("D1", msg(1), now);
        area.stage("D1", msg(2), now);

        assert_eq!(area.drain("D1", now), vec![msg(1), msg(2)]);
        assert!(area.drain("D1", now).is_empty());
        assert_eq!(area.queue_count(), 0);
    }

    #[test]
    fn test_drain_filters_expired_without_sweep() {
        let t0 = Instant::now();
        let expire = Duration::from_secs(10);
        let mut area = StagingArea::new(expire);
        area.stage("D1", msg(1), t0);
        area.stage("D1", msg(2), t0 + Duration::from_secs(5));

        // Exactly at T+expiry the first message is gone.
        assert_eq!(area.drain("D1", t0 + expire), vec![msg(2)]);
    }

    #[test]
    fn test_drain_before_expiry() {
        let t0 = Instant::now();
        let expire = Duration::from_secs(10);
        let mut area = StagingArea::new(expire);
        area.stage("D1", msg(1), t0);
        assert_eq!(area.drain("D1", t0 + expire - Duration::from_millis(1)), vec![msg(1)]);
    }

    #[test]
    fn test_sweep() {
        let t0 = Instant::now();
        let mut area = StagingArea::new(Duration::from_secs(10));
        area.stage("D1", msg(1), t0);
        area.stage("D2", msg(2), t0);
        area.stage("D2", msg(3), t0 + Duration::from_secs(8));

        assert_eq!(area.sweep(t0 + Duration::from_secs(9)), 0);
        assert_eq!(area.total(), 3);

        assert_eq!(area.sweep(t0 + Duration::from_secs(10)), 2);
        assert_eq!(area.pending("D1"), 0);
        assert_eq!(area.pending("D2"), 1);
        assert_eq!(area.queue_count(), 1);

        assert_eq!(area.sweep(t0 + Duration::from_secs(30)), 1);
        assert_eq!(area.queue_count(), 0);
    }
}
