//! Presence tracking.
//!
//! A user is online while at least one of their presence connections is
//! open and their last heartbeat is within the TTL. The tracker reports the
//! 0→1 and 1→0 edges so that exactly one `online` and one `offline` event
//! is published per episode, however many sockets the user holds.
//!
//! Connections that die without a clean close are reconciled by a periodic
//! sweep that drops entries whose heartbeat has gone stale.

use crate::hub::Hub;
use crate::message::Message;
use crate::telemetry;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default liveness TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Default sweep period.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(20);

/// Presence tracker configuration.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// How long an entry stays fresh without a heartbeat.
    pub ttl: Duration,
    /// How often the sweeper runs.
    pub sweep_interval: Duration,
    /// Publish `offline` for users the sweep expires.
    pub announce_expired: bool,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            announce_expired: true,
        }
    }
}

/// Live state for one user.
#[derive(Debug, Clone)]
struct PresenceEntry {
    open_connections: usize,
    last_heartbeat: Instant,
    generation: u64,
}

impl PresenceEntry {
    fn touch(&mut self, now: Instant) {
        self.last_heartbeat = self.last_heartbeat.max(now);
    }

    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) <= ttl
    }
}

/// Proof that a session incremented a user's connection count.
///
/// Releasing a lease only decrements the entry it was taken on. If the sweep
/// expired that entry and the user has since reconnected, the release is a
/// no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceLease {
    user_id: String,
    generation: u64,
    went_online: bool,
}

impl PresenceLease {
    /// The user the lease was taken for.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Whether taking this lease moved the user from offline to online.
    #[must_use]
    pub fn went_online(&self) -> bool {
        self.went_online
    }
}

/// An online user, as returned to presence queries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OnlineUser {
    /// User ID.
    #[serde(rename = "userId")]
    pub user_id: String,
}

/// Per-user connection counter with heartbeat expiry.
pub struct PresenceTracker {
    entries: DashMap<String, PresenceEntry>,
    next_generation: AtomicU64,
    config: PresenceConfig,
}

impl PresenceTracker {
    /// Create a tracker with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PresenceConfig::default())
    }

    /// Create a tracker with custom configuration.
    #[must_use]
    pub fn with_config(config: PresenceConfig) -> Self {
        info!("Creating presence tracker with config: {:?}", config);
        Self {
            entries: DashMap::new(),
            next_generation: AtomicU64::new(1),
            config,
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Count a new connection for a user.
    ///
    /// Returns `true` iff the user had no open connections before.
    pub fn increment(&self, user_id: &str) -> bool {
        self.acquire(user_id).went_online
    }

    /// Count a new connection and return a lease for releasing it.
    pub fn acquire(&self, user_id: &str) -> PresenceLease {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceEntry {
                open_connections: 0,
                last_heartbeat: now,
                generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            });

        entry.open_connections += 1;
        entry.touch(now);
        let connections = entry.open_connections;
        let generation = entry.generation;
        let went_online = entry.open_connections == 1;
        drop(entry);
        if went_online {
            telemetry::set_users_online(self.entries.len());
        }

        debug!(
            user = %user_id,
            connections,
            went_online,
            "Presence: connection opened"
        );

        PresenceLease {
            user_id: user_id.to_string(),
            generation,
            went_online,
        }
    }

    /// Uncount a connection for a user.
    ///
    /// Returns `true` iff this closed the user's last connection. Unknown
    /// users are left alone and yield `false`.
    pub fn decrement(&self, user_id: &str) -> bool {
        self.decrement_if(user_id, |_| true)
    }

    /// Uncount the connection a lease was taken for.
    ///
    /// Returns `true` iff this closed the user's last connection.
    pub fn release(&self, lease: &PresenceLease) -> bool {
        self.decrement_if(&lease.user_id, |entry| entry.generation == lease.generation)
    }

    fn decrement_if(&self, user_id: &str, matches: impl FnOnce(&PresenceEntry) -> bool) -> bool {
        let went_offline = self.remove_connection(user_id, matches);
        if went_offline {
            telemetry::set_users_online(self.entries.len());
        }
        went_offline
    }

    fn remove_connection(
        &self,
        user_id: &str,
        matches: impl FnOnce(&PresenceEntry) -> bool,
    ) -> bool {
        if !self.entries.contains_key(user_id) {
            return false;
        }

        match self.entries.entry(user_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !matches(occupied.get()) {
                    debug!(user = %user_id, "Presence: stale release ignored");
                    return false;
                }
                if occupied.get().open_connections <= 1 {
                    occupied.remove();
                    debug!(user = %user_id, "Presence: last connection closed");
                    true
                } else {
                    let entry = occupied.get_mut();
                    entry.open_connections -= 1;
                    debug!(
                        user = %user_id,
                        connections = entry.open_connections,
                        "Presence: connection closed"
                    );
                    false
                }
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Refresh a user's heartbeat. No-op for unknown users.
    pub fn touch(&self, user_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(user_id) {
            entry.touch(Instant::now());
        }
    }

    /// Drop every entry whose heartbeat is older than the TTL.
    ///
    /// Returns the expired user IDs.
    pub fn sweep(&self) -> Vec<String> {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut expired = Vec::new();

        self.entries.retain(|user_id, entry| {
            if entry.is_fresh(now, ttl) {
                true
            } else {
                debug!(
                    user = %user_id,
                    connections = entry.open_connections,
                    "Presence: expired stale entry"
                );
                expired.push(user_id.clone());
                false
            }
        });

        if !expired.is_empty() {
            telemetry::set_users_online(self.entries.len());
        }
        expired
    }

    /// Publish `offline` for expired users that have not reconnected.
    ///
    /// Each user's map slot stays locked while its `offline` is published, so
    /// a concurrent reconnect either shows up here and suppresses the event,
    /// or acquires afterwards and announces `online` after it.
    ///
    /// Returns the number of users announced.
    pub fn announce_expired(&self, hub: &Hub, expired: &[String]) -> usize {
        let mut announced = 0;

        for user_id in expired {
            match self.entries.entry(user_id.clone()) {
                Entry::Occupied(_) => {
                    debug!(user = %user_id, "Presence: reconnected before expiry was announced");
                }
                Entry::Vacant(_slot) => {
                    match hub.publish_message(&Message::offline(user_id)) {
                        Ok(_) => announced += 1,
                        Err(e) => warn!(user = %user_id, error = %e, "Failed to announce expiry"),
                    }
                }
            }
        }

        announced
    }

    /// Sweep, then publish `offline` for every expired user if configured.
    pub fn sweep_and_announce(&self, hub: &Hub) -> Vec<String> {
        let expired = self.sweep();
        if self.config.announce_expired {
            self.announce_expired(hub, &expired);
        }
        expired
    }

    /// IDs of users that are online right now.
    #[must_use]
    pub fn snapshot_online(&self) -> HashSet<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| e.is_fresh(now, self.config.ttl))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Online users sorted by ID.
    #[must_use]
    pub fn list_online(&self) -> Vec<OnlineUser> {
        let mut users: Vec<OnlineUser> = self
            .snapshot_online()
            .into_iter()
            .map(|user_id| OnlineUser { user_id })
            .collect();
        users.sort();
        users
    }

    /// Whether a user is online right now.
    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.entries
            .get(user_id)
            .map(|e| e.is_fresh(Instant::now(), self.config.ttl))
            .unwrap_or(false)
    }

    /// Open presence connections for a user.
    #[must_use]
    pub fn connection_count(&self, user_id: &str) -> usize {
        self.entries
            .get(user_id)
            .map(|e| e.open_connections)
            .unwrap_or(0)
    }

    /// Number of tracked users, fresh or not.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    /// Start the periodic sweep.
    ///
    /// The task runs until [`SweeperHandle::shutdown`] is called.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>, hub: Arc<Hub>) -> SweeperHandle {
        let tracker = Arc::clone(self);
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let period = self.config.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?period, "Presence sweeper started");

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = tracker.sweep_and_announce(&hub);
                        if !expired.is_empty() {
                            info!(expired = expired.len(), "Presence sweep expired users");
                        }
                    }
                }
            }

            info!("Presence sweeper stopped");
        });

        SweeperHandle { token, handle }
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner of the running sweep task.
#[derive(Debug)]
pub struct SweeperHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Token that stops the sweeper when cancelled.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the sweeper and wait for it to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Presence sweeper panicked");
        }
    }
}
