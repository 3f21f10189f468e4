//! Sharded, concurrently accessible session table.
//!
//! Each shard is a [`SessionRegistry`] behind its own `tokio::sync::Mutex`.
//! A PIN always hashes to the same shard, so concurrent registrations for
//! one PIN serialize on that shard's lock (the one committed second wins),
//! while registrations for unrelated PINs usually take different locks.

use std::hash::{BuildHasher, RandomState};

use pinlock_protocol::{DeviceId, Pin};
use pinlock_transport::ConnectionId;
use tokio::sync::Mutex;

use crate::{Holder, Registration, Session, SessionConfig, SessionRegistry};

/// The authority's single source of truth for PIN → holder.
pub struct SessionTable {
    shards: Vec<Mutex<SessionRegistry>>,
    hasher: RandomState,
    config: SessionConfig,
}

impl SessionTable {
    /// Creates an empty table.
    pub fn new(config: SessionConfig) -> Self {
        let shard_count = config.shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(SessionRegistry::new()))
            .collect();
        Self {
            shards,
            hasher: RandomState::new(),
            config,
        }
    }

    /// Returns the table's configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn shard_for(&self, pin: &Pin) -> &Mutex<SessionRegistry> {
        let idx = (self.hasher.hash_one(pin) as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Commits `holder` as the holder of `pin`.
    ///
    /// `on_commit` runs after the registry has been updated and before the
    /// shard lock is released. Callers use it to enqueue notifications, so
    /// that the order in which devices are told about registrations for a
    /// PIN is exactly the commit order. It must not block or await.
    pub async fn register<F>(
        &self,
        pin: Pin,
        holder: Holder,
        on_commit: F,
    ) -> Registration
    where
        F: FnOnce(&Registration),
    {
        let mut shard = self.shard_for(&pin).lock().await;
        let outcome = shard.register(pin, holder);
        on_commit(&outcome);
        outcome
    }

    /// Clears every session `device_id` holds through `connection`.
    pub async fn release(
        &self,
        device_id: &DeviceId,
        connection: ConnectionId,
    ) -> Vec<Pin> {
        let mut released = Vec::new();
        for shard in &self.shards {
            released.extend(shard.lock().await.release(device_id, connection));
        }
        released
    }

    /// Refreshes liveness for the sessions `device_id` holds through
    /// `connection`.
    pub async fn touch(
        &self,
        device_id: &DeviceId,
        connection: ConnectionId,
    ) -> usize {
        let mut refreshed = 0;
        for shard in &self.shards {
            refreshed += shard.lock().await.touch(device_id, connection);
        }
        refreshed
    }

    /// Clears every session whose holder missed the heartbeat timeout.
    ///
    /// `on_expired` runs for each cleared session while its shard is still
    /// locked, for the same ordering reason as in [`register`](Self::register).
    pub async fn expire_stale<F>(&self, mut on_expired: F) -> usize
    where
        F: FnMut(&Session),
    {
        let mut count = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().await;
            for session in shard.expire_stale(self.config.heartbeat_timeout) {
                on_expired(&session);
                count += 1;
            }
        }
        count
    }

    /// Returns a copy of the session for `pin`, if one is committed.
    pub async fn get(&self, pin: &Pin) -> Option<Session> {
        self.shard_for(pin).lock().await.get(pin).cloned()
    }

    /// Total number of committed sessions.
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.lock().await.len();
        }
        total
    }

    /// Returns `true` if no PIN is held.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
