//! In-memory device cache.
//!
//! Holds everything the gateway needs at runtime without touching the
//! directory: identities (by client id and by auth key), online sessions,
//! publish-rate state, group membership with its reverse index, connection
//! modes, staged messages for polling devices, and poll activity.
//!
//! Each map sits behind its own lock and no method holds two of them at once.
//! Operations that must be atomic per key (`record_publish`, `set_groups`,
//! stage/drain/sweep) complete inside a single critical section.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::Config;
use crate::groups::GroupIndex;
use crate::staging::StagingArea;
use crate::types::{CacheStats, ConnectionMode, Device, ForwardMessage, SessionHandle};

/// Shared runtime state of all devices.
pub struct DeviceCache {
    devices: RwLock<HashMap<String, Device>>,
    devices_by_auth_key: RwLock<HashMap<String, Device>>,
    last_publish: Mutex<HashMap<String, Instant>>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    groups: RwLock<GroupIndex>,
    modes: RwLock<HashMap<String, ConnectionMode>>,
    staging: Mutex<StagingArea>,
    last_polled: RwLock<HashMap<String, Instant>>,
    publish_interval: Duration,
}

impl DeviceCache {
    /// Create a cache with the given rate limit and staged-message lifetime.
    pub fn new(publish_interval: Duration, expire: Duration) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            devices_by_auth_key: RwLock::new(HashMap::new()),
            last_publish: Mutex::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            groups: RwLock::new(GroupIndex::new()),
            modes: RwLock::new(HashMap::new()),
            staging: Mutex::new(StagingArea::new(expire)),
            last_polled: RwLock::new(HashMap::new()),
            publish_interval,
        }
    }

    /// Create a cache from the `message` section of a config.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.message.publish_interval, config.message.expire)
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub fn upsert_device(&self, client_id: &str, device: Device) {
        self.devices.write().insert(client_id.to_string(), device);
    }

    pub fn get_device(&self, client_id: &str) -> Option<Device> {
        self.devices.read().get(client_id).cloned()
    }

    pub fn upsert_device_by_auth_key(&self, auth_key: &str, device: Device) {
        self.devices_by_auth_key
            .write()
            .insert(auth_key.to_string(), device);
    }

    pub fn get_device_by_auth_key(&self, auth_key: &str) -> Option<Device> {
        self.devices_by_auth_key.read().get(auth_key).cloned()
    }

    /// Purge identity, auth-key alias, rate state, poll activity and group
    /// membership.
    ///
    /// Sessions, modes and staged messages are left alone. Modes are one
    /// entry per client that ever switched and are kept across removal.
    pub fn remove_device(&self, client_id: &str, auth_key: &str) {
        self.devices.write().remove(client_id);
        self.devices_by_auth_key.write().remove(auth_key);
        self.last_publish.lock().remove(client_id);
        self.last_polled.write().remove(client_id);
        if let Some(groups) = self.groups.write().remove(client_id) {
            debug!("Removed {} from {} cached groups", client_id, groups.len());
        }
    }

    // ------------------------------------------------------------------
    // Publish rate
    // ------------------------------------------------------------------

    /// Record a publish attempt. Returns false if it came too soon after the
    /// last accepted one, in which case nothing is recorded.
    pub fn record_publish(&self, client_id: &str) -> bool {
        let now = Instant::now();
        let mut last = self.last_publish.lock();
        if let Some(prev) = last.get(client_id) {
            if now.duration_since(*prev) < self.publish_interval {
                return false;
            }
        }
        last.insert(client_id.to_string(), now);
        true
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Bind a live session to `client_id`, replacing any previous one.
    pub fn set_online(&self, client_id: &str, session: SessionHandle) {
        self.sessions.write().insert(client_id.to_string(), session);
    }

    pub fn set_offline(&self, client_id: &str) {
        self.sessions.write().remove(client_id);
    }

    /// Unbind `client_id` only if it is still bound to `session`.
    ///
    /// Returns false when a newer session took over in the meantime.
    pub fn set_offline_session(&self, client_id: &str, session: &SessionHandle) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(client_id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(client_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_online(&self, client_id: &str) -> bool {
        self.sessions.read().contains_key(client_id)
    }

    pub fn get_session(&self, client_id: &str) -> Option<SessionHandle> {
        self.sessions.read().get(client_id).cloned()
    }

    /// Online clients whose mode is live, sorted.
    pub fn online_live_clients(&self) -> Vec<String> {
        let online: Vec<String> = self.sessions.read().keys().cloned().collect();
        let modes = self.modes.read();
        let mut live: Vec<String> = online
            .into_iter()
            .filter(|id| modes.get(id).copied().unwrap_or_default() == ConnectionMode::Live)
            .collect();
        live.sort();
        live
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    /// Replace the cached group set of `client_id`.
    pub fn set_groups<I, S>(&self, client_id: &str, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.write().set(client_id, groups);
    }

    pub fn is_in_group(&self, client_id: &str, group: &str) -> bool {
        self.groups.read().contains(client_id, group)
    }

    pub fn members_of(&self, group: &str) -> HashSet<String> {
        self.groups.read().members(group)
    }

    pub fn groups_of(&self, client_id: &str) -> Vec<String> {
        self.groups.read().groups_of(client_id)
    }

    /// Verify the forward map and reverse index agree.
    pub fn check_group_consistency(&self) -> Result<(), String> {
        self.groups.read().check_consistency()
    }

    // ------------------------------------------------------------------
    // Connection mode
    // ------------------------------------------------------------------

    pub fn set_mode(&self, client_id: &str, mode: ConnectionMode) {
        self.modes.write().insert(client_id.to_string(), mode);
    }

    /// Connection mode of `client_id`, live when never set.
    pub fn get_mode(&self, client_id: &str) -> ConnectionMode {
        self.modes.read().get(client_id).copied().unwrap_or_default()
    }

    pub fn is_polling(&self, client_id: &str) -> bool {
        self.get_mode(client_id) == ConnectionMode::Polling
    }

    // ------------------------------------------------------------------
    // Staging
    // ------------------------------------------------------------------

    pub fn stage(&self, client_id: &str, message: ForwardMessage) {
        self.staging.lock().stage(client_id, message, Instant::now());
        trace!("Staged message for {}", client_id);
    }

    /// Take every live staged message of `client_id`.
    pub fn drain_staged(&self, client_id: &str) -> Vec<ForwardMessage> {
        self.staging.lock().drain(client_id, Instant::now())
    }

    /// Drop expired staged messages. Returns how many were dropped.
    ///
    /// Rate entries older than the publish interval are pruned as well; an
    /// absent entry admits the next publish exactly like a stale one.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let interval = self.publish_interval;
        self.last_publish
            .lock()
            .retain(|_, last| now.duration_since(*last) < interval);

        let dropped = self.staging.lock().sweep(now);
        if dropped > 0 {
            debug!("Swept {} expired staged messages", dropped);
        }
        dropped
    }

    pub fn pending_count(&self, client_id: &str) -> usize {
        self.staging.lock().pending(client_id)
    }

    // ------------------------------------------------------------------
    // Poll activity
    // ------------------------------------------------------------------

    pub fn touch_polled(&self, client_id: &str) {
        self.last_polled
            .write()
            .insert(client_id.to_string(), Instant::now());
    }

    pub fn last_polled(&self, client_id: &str) -> Option<Instant> {
        self.last_polled.read().get(client_id).copied()
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            cached_devices: self.devices.read().len(),
            online_clients: self.sessions.read().len(),
            pending_messages: self.staging.lock().total(),
        }
    }

    /// Spawn the periodic expiry sweep on the current tokio runtime.
    ///
    /// The task only holds a weak reference and exits on its own once the
    /// cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> Sweeper {
        let cache: Weak<DeviceCache> = Arc::downgrade(self);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match cache.upgrade() {
                            Some(cache) => {
                                cache.sweep_expired();
                            }
                            None => break,
                        }
                    }
                }
            }
            debug!("Expiry sweeper stopped");
        });

        info!("Expiry sweeper started, every {:?}", every);
        Sweeper {
            cancel,
            handle: Some(handle),
        }
    }
}

impl std::fmt::Debug for DeviceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCache")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Handle to a running expiry sweep. Dropping it stops the sweep.
pub struct Sweeper {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Stop the sweep and wait for the task to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const INTERVAL: Duration = Duration::from_millis(100);
    const EXPIRE: Duration = Duration::from_secs(10);

    fn cache() -> DeviceCache {
        DeviceCache::new(INTERVAL, EXPIRE)
    }

    fn device(client_id: &str) -> Device {
        Device {
            id: 1,
            uuid: format!("uuid-{}", client_id),
            token: "token".to_string(),
            auth_key: format!("ak-{}", client_id),
            client_id: Some(client_id.to_string()),
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            iot_token: None,
        }
    }

    fn session(counter: &Arc<AtomicUsize>) -> SessionHandle {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_identity_upsert_and_lookup() {
        let cache = cache();
        assert!(cache.get_device("D1").is_none());

        cache.upsert_device("D1", device("D1"));
        cache.upsert_device_by_auth_key("ak-D1", device("D1"));
        assert_eq!(cache.get_device("D1"), Some(device("D1")));
        assert_eq!(cache.get_device_by_auth_key("ak-D1"), Some(device("D1")));

        let mut updated = device("D1");
        updated.password = Some("rotated".to_string());
        cache.upsert_device("D1", updated.clone());
        assert_eq!(cache.get_device("D1"), Some(updated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_device_purges_everything() {
        let cache = cache();
        cache.upsert_device("D1", device("D1"));
        cache.upsert_device_by_auth_key("ak-D1", device("D1"));
        cache.set_groups("D1", ["G", "H"]);
        cache.set_groups("D2", ["G"]);
        assert!(cache.record_publish("D1"));
        cache.touch_polled("D1");

        cache.remove_device("D1", "ak-D1");
        assert!(cache.last_polled("D1").is_none());

        assert!(cache.get_device("D1").is_none());
        assert!(cache.get_device_by_auth_key("ak-D1").is_none());
        assert!(!cache.is_in_group("D1", "G"));
        assert!(!cache.is_in_group("D1", "H"));
        assert!(cache.groups_of("D1").is_empty());
        assert!(cache.members_of("H").is_empty());
        assert_eq!(cache.members_of("G"), HashSet::from(["D2".to_string()]));
        // Rate state is gone, so an immediate publish passes again.
        assert!(cache.record_publish("D1"));
        cache.check_group_consistency().unwrap();

        // Removing an unknown device is a no-op.
        cache.remove_device("nobody", "nothing");
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_publish_rate_limit() {
        let cache = cache();
        assert!(cache.record_publish("D1"));
        assert!(!cache.record_publish("D1"));

        // A rejected attempt does not push the window forward.
        tokio::time::advance(INTERVAL - Duration::from_millis(1)).await;
        assert!(!cache.record_publish("D1"));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.record_publish("D1"));

        // Other clients are independent.
        assert!(cache.record_publish("D2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_prunes_stale_rate_entries() {
        let cache = cache();
        for i in 0..10 {
            assert!(cache.record_publish(&format!("ghost-{}", i)));
        }
        cache.sweep_expired();
        assert_eq!(cache.last_publish.lock().len(), 10);

        tokio::time::advance(INTERVAL).await;
        assert!(cache.record_publish("D1"));
        cache.sweep_expired();
        assert_eq!(cache.last_publish.lock().len(), 1);
        // The surviving entry still limits.
        assert!(!cache.record_publish("D1"));
        assert!(cache.record_publish("ghost-0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_publish_spaced() {
        let cache = cache();
        assert!(cache.record_publish("D1"));
        tokio::time::advance(INTERVAL).await;
        assert!(cache.record_publish("D1"));
    }

    #[test]
    fn test_record_publish_concurrent_single_winner() {
        let cache = Arc::new(DeviceCache::new(Duration::from_secs(3600), EXPIRE));
        let allowed = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let allowed = Arc::clone(&allowed);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        if cache.record_publish("D1") {
                            allowed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(allowed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sessions() {
        let cache = cache();
        let closed = Arc::new(AtomicUsize::new(0));
        let first = session(&closed);
        let second = session(&closed);

        assert!(!cache.is_online("D1"));
        cache.set_online("D1", Arc::clone(&first));
        assert!(cache.is_online("D1"));
        assert!(cache.get_session("D1").is_some());

        // Reconnect replaces the session; the stale disconnect is ignored.
        cache.set_online("D1", Arc::clone(&second));
        assert!(!cache.set_offline_session("D1", &first));
        assert!(cache.is_online("D1"));
        assert!(cache.set_offline_session("D1", &second));
        assert!(!cache.is_online("D1"));

        cache.set_online("D1", first);
        cache.set_offline("D1");
        assert!(cache.get_session("D1").is_none());
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_online_live_clients() {
        let cache = cache();
        let closed = Arc::new(AtomicUsize::new(0));
        cache.set_online("D2", session(&closed));
        cache.set_online("D1", session(&closed));
        cache.set_online("D3", session(&closed));
        cache.set_mode("D3", ConnectionMode::Polling);

        assert_eq!(cache.online_live_clients(), vec!["D1".to_string(), "D2".to_string()]);
    }

    #[test]
    fn test_groups_reverse_index() {
        let cache = cache();
        cache.set_groups("D1", ["A", "B"]);
        cache.set_groups("D2", ["B"]);
        cache.set_groups("D1", ["B", "C"]);

        assert!(!cache.is_in_group("D1", "A"));
        assert!(cache.members_of("A").is_empty());
        assert_eq!(cache.members_of("B").len(), 2);
        assert_eq!(cache.members_of("C"), HashSet::from(["D1".to_string()]));
        assert_eq!(cache.groups_of("D1"), vec!["B".to_string(), "C".to_string()]);
        cache.check_group_consistency().unwrap();
    }

    #[test]
    fn test_set_groups_concurrent() {
        let cache = Arc::new(cache());
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let client = format!("D{}", i % 5);
                        let groups = [format!("G{}", (i + t) % 3), format!("G{}", (i * t) % 4)];
                        cache.set_groups(&client, groups);
                        if i % 17 == 0 {
                            cache.remove_device(&client, "");
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        cache.check_group_consistency().unwrap();
    }

    #[test]
    fn test_mode_defaults_to_live() {
        let cache = cache();
        assert_eq!(cache.get_mode("D1"), ConnectionMode::Live);
        assert!(!cache.is_polling("D1"));
        cache.set_mode("D1", ConnectionMode::Polling);
        assert!(cache.is_polling("D1"));
        cache.set_mode("D1", ConnectionMode::Live);
        assert_eq!(cache.get_mode("D1"), ConnectionMode::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_and_drain() {
        let cache = cache();
        let msg = ForwardMessage::from_device("D2", json!("x"));
        cache.stage("D1", msg.clone());
        assert_eq!(cache.pending_count("D1"), 1);

        tokio::time::advance(EXPIRE - Duration::from_millis(1)).await;
        assert_eq!(cache.drain_staged("D1"), vec![msg]);
        assert!(cache.drain_staged("D1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_excludes_expired_before_sweep() {
        let cache = cache();
        cache.stage("D1", ForwardMessage::from_device("D2", json!("old")));
        tokio::time::advance(EXPIRE).await;
        assert!(cache.drain_staged("D1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expired() {
        let cache = cache();
        cache.stage("D1", ForwardMessage::from_device("D2", json!(1)));
        tokio::time::advance(Duration::from_secs(5)).await;
        cache.stage("D1", ForwardMessage::from_device("D2", json!(2)));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.pending_count("D1"), 1);
        assert_eq!(cache.stats().pending_messages, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task() {
        let cache = Arc::new(cache());
        cache.stage("D1", ForwardMessage::from_device("D2", json!(1)));

        let sweeper = cache.spawn_sweeper(Duration::from_secs(1));
        tokio::time::sleep(EXPIRE + Duration::from_secs(2)).await;
        assert_eq!(cache.pending_count("D1"), 0);

        sweeper.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_exits_when_cache_dropped() {
        let cache = Arc::new(cache());
        let sweeper = cache.spawn_sweeper(Duration::from_secs(1));
        drop(cache);

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(sweeper.is_finished());
    }

    #[test]
    fn test_concurrent_stage_drain_sweep_no_loss_no_dup() {
        let cache = Arc::new(DeviceCache::new(INTERVAL, Duration::from_secs(3600)));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        cache.stage("D1", ForwardMessage::from_device("src", json!(p * 1000 + i)));
                    }
                })
            })
            .collect();

        let sweeper = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    cache.sweep_expired();
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 1000 {
            seen.extend(cache.drain_staged("D1"));
            std::thread::yield_now();
        }
        for p in producers {
            p.join().unwrap();
        }
        sweeper.join().unwrap();
        seen.extend(cache.drain_staged("D1"));

        let unique: HashSet<i64> = seen.iter().map(|m| m.data.as_i64().unwrap()).collect();
        assert_eq!(seen.len(), 1000);
        assert_eq!(unique.len(), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_activity_and_stats() {
        let cache = cache();
        assert!(cache.last_polled("D1").is_none());
        cache.touch_polled("D1");
        let first = cache.last_polled("D1").unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.touch_polled("D1");
        assert!(cache.last_polled("D1").unwrap() > first);

        let closed = Arc::new(AtomicUsize::new(0));
        cache.upsert_device("D1", device("D1"));
        cache.upsert_device("D2", device("D2"));
        cache.set_online("D1", session(&closed));
        assert_eq!(
            cache.stats(),
            CacheStats {
                cached_devices: 2,
                online_clients: 1,
                pending_messages: 0
            }
        );
    }
}
