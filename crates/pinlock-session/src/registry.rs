//! The session registry: which device holds which PIN.
//!
//! This is the arbitration core. It is responsible for:
//! - Committing registrations and reporting who was displaced
//! - Releasing sessions on voluntary logout
//! - Refreshing liveness on heartbeats
//! - Expiring holders that stopped heartbeating
//!
//! # Concurrency note
//!
//! `SessionRegistry` is NOT thread-safe by itself: it uses plain
//! `HashMap`s. The [`SessionTable`](crate::SessionTable) owns several
//! registries, each behind its own mutex, and routes every PIN to a fixed
//! one. Every method here is therefore one indivisible step with respect
//! to other registrations for the same PIN.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

use pinlock_protocol::{DeviceId, Pin};
use pinlock_transport::ConnectionId;
use tokio::time::Instant;

use crate::{Holder, Registration, Session};

/// Maps PINs to their single current holder.
///
/// ## Lifecycle of one PIN
///
/// ```text
/// register() ──→ [held by A] ──register() by B──→ [held by B]
///                    │                               │
///          release()/expire_stale()         release()/expire_stale()
///                    ▼                               ▼
///                 [free] ←──────────────────────── [free]
/// ```
#[derive(Debug, Default)]
pub struct SessionRegistry {
    /// Committed sessions, keyed by PIN. One entry per PIN is the
    /// arbitration invariant.
    sessions: HashMap<Pin, Session>,

    /// Index from device to the PINs it holds, kept in sync with
    /// `sessions` so logout and heartbeat don't scan every session.
    by_device: HashMap<DeviceId, HashSet<Pin>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `holder` the holder of `pin`, replacing whoever held it.
    ///
    /// The PIN must already have been verified; this only arbitrates.
    pub fn register(&mut self, pin: Pin, holder: Holder) -> Registration {
        let now = Instant::now();

        let outcome = match self.sessions.get(&pin) {
            None => Registration::New,
            Some(existing)
                if existing.holder.device_id == holder.device_id
                    && existing.holder.connection == holder.connection =>
            {
                Registration::Refreshed
            }
            Some(existing) if existing.holder.device_id == holder.device_id => {
                Registration::SameDeviceElsewhere {
                    previous: existing.holder.clone(),
                }
            }
            Some(existing) => Registration::TakenOver {
                previous: existing.holder.clone(),
            },
        };

        if let Registration::TakenOver { previous } = &outcome {
            self.unindex(&previous.device_id, &pin);
        }

        self.by_device
            .entry(holder.device_id.clone())
            .or_default()
            .insert(pin.clone());

        tracing::info!(
            device_id = %holder.device_id,
            connection = %holder.connection,
            outcome = outcome_name(&outcome),
            "session registered"
        );

        self.sessions.insert(
            pin.clone(),
            Session {
                pin,
                holder,
                registered_at: SystemTime::now(),
                last_seen: now,
            },
        );

        outcome
    }

    /// Clears every session `device_id` holds through `connection`.
    ///
    /// Returns the PINs that were freed. Releasing something not held is a
    /// no-op, never an error.
    pub fn release(
        &mut self,
        device_id: &DeviceId,
        connection: ConnectionId,
    ) -> Vec<Pin> {
        let held: Vec<Pin> = self
            .by_device
            .get(device_id)
            .map(|pins| pins.iter().cloned().collect())
            .unwrap_or_default();

        let mut released = Vec::new();
        for pin in held {
            let owned = self
                .sessions
                .get(&pin)
                .is_some_and(|s| s.holder.connection == connection);
            if owned {
                self.sessions.remove(&pin);
                self.unindex(device_id, &pin);
                released.push(pin);
            }
        }

        if !released.is_empty() {
            tracing::info!(
                %device_id,
                %connection,
                count = released.len(),
                "sessions released"
            );
        }
        released
    }

    /// Records a heartbeat from `connection` for the sessions `device_id`
    /// holds through it. Returns how many sessions were refreshed.
    pub fn touch(
        &mut self,
        device_id: &DeviceId,
        connection: ConnectionId,
    ) -> usize {
        let Some(pins) = self.by_device.get(device_id) else {
            return 0;
        };

        let now = Instant::now();
        let mut refreshed = 0;
        for pin in pins {
            if let Some(session) = self.sessions.get_mut(pin) {
                if session.holder.connection == connection {
                    session.last_seen = now;
                    refreshed += 1;
                }
            }
        }
        refreshed
    }

    /// Removes and returns every session whose holder has not been seen
    /// within `timeout`.
    pub fn expire_stale(&mut self, timeout: Duration) -> Vec<Session> {
        let stale: Vec<Pin> = self
            .sessions
            .values()
            .filter(|s| s.is_stale(timeout))
            .map(|s| s.pin.clone())
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for pin in stale {
            if let Some(session) = self.sessions.remove(&pin) {
                self.unindex(&session.holder.device_id, &pin);
                tracing::info!(
                    device_id = %session.holder.device_id,
                    connection = %session.holder.connection,
                    "session expired (no heartbeat)"
                );
                expired.push(session);
            }
        }
        expired
    }

    /// Looks up the session for a PIN.
    pub fn get(&self, pin: &Pin) -> Option<&Session> {
        self.sessions.get(pin)
    }

    /// PINs currently held by a device, through any connection.
    pub fn pins_held_by(&self, device_id: &DeviceId) -> Vec<Pin> {
        self.by_device
            .get(device_id)
            .map(|pins| pins.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of committed sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if no PIN is held.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn unindex(&mut self, device_id: &DeviceId, pin: &Pin) {
        if let Some(pins) = self.by_device.get_mut(device_id) {
            pins.remove(pin);
            if pins.is_empty() {
                self.by_device.remove(device_id);
            }
        }
    }
}

fn outcome_name(outcome: &Registration) -> &'static str {
    match outcome {
        Registration::New => "new",
        Registration::Refreshed => "refreshed",
        Registration::SameDeviceElsewhere { .. } => "same-device-elsewhere",
        Registration::TakenOver { .. } => "taken-over",
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    //! Unit tests for `SessionRegistry`.
    //!
    //! Naming convention: `test_{function}_{scenario}_{expected}`.
    //!
    //! Time-dependent expiry is tested with two extremes instead of
    //! sleeping: a zero timeout (everything is stale) and a one-hour
    //! timeout (nothing is).

    use super::*;

    fn pin(p: &str) -> Pin {
        Pin::parse(p).expect("valid pin")
    }

    fn holder(device: &str, conn: u64) -> Holder {
        Holder {
            device_id: DeviceId::new(device),
            device_label: format!("label-{device}"),
            connection: ConnectionId::new(conn),
        }
    }

    // =====================================================================
    // register()
    // =====================================================================

    #[test]
    fn test_register_free_pin_returns_new() {
        let mut reg = SessionRegistry::new();

        let outcome = reg.register(pin("1234"), holder("a", 1));

        assert_eq!(outcome, Registration::New);
        assert_eq!(reg.get(&pin("1234")).unwrap().holder, holder("a", 1));
    }

    #[test]
    fn test_register_same_connection_again_is_refresh() {
        let mut reg = SessionRegistry::new();
        reg.register(pin("1234"), holder("a", 1));

        let outcome = reg.register(pin("1234"), holder("a", 1));

        assert_eq!(outcome, Registration::Refreshed);
        assert!(outcome.displaced().is_none(), "no one is displaced");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_register_same_device_new_connection_displaces_old_connection() {
        let mut reg = SessionRegistry::new();
        reg.register(pin("1234"), holder("a", 1));

        let outcome = reg.register(pin("1234"), holder("a", 2));

        assert_eq!(
            outcome,
            Registration::SameDeviceElsewhere {
                previous: holder("a", 1)
            }
        );
        assert_eq!(
            reg.get(&pin("1234")).unwrap().holder.connection,
            ConnectionId::new(2)
        );
        assert_eq!(reg.pins_held_by(&DeviceId::new("a")), vec![pin("1234")]);
    }

    #[test]
    fn test_register_other_device_takes_over() {
        let mut reg = SessionRegistry::new();
        reg.register(pin("1234"), holder("a", 1));

        let outcome = reg.register(pin("1234"), holder("b", 2));

        assert_eq!(
            outcome,
            Registration::TakenOver {
                previous: holder("a", 1)
            }
        );
        assert_eq!(outcome.displaced(), Some(&holder("a", 1)));
        // Exactly one holder per PIN.
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(&pin("1234")).unwrap().holder, holder("b", 2));
        // The displaced device no longer holds anything.
        assert!(reg.pins_held_by(&DeviceId::new("a")).is_empty());
    }

    #[test]
    fn test_register_later_commit_wins() {
        let mut reg = SessionRegistry::new();
        reg.register(pin("1234"), holder("a", 1));
        reg.register(pin("1234"), holder("b", 2));

        let outcome = reg.register(pin("1234"), holder("a", 1));

        assert_eq!(
            outcome,
            Registration::TakenOver {
                previous: holder("b", 2)
            }
        );
        assert_eq!(reg.get(&pin("1234")).unwrap().holder, holder("a", 1));
    }

    #[test]
    fn test_register_different_pins_are_independent() {
        let mut reg = SessionRegistry::new();

        assert_eq!(reg.register(pin("1111"), holder("a", 1)), Registration::New);
        assert_eq!(reg.register(pin("2222"), holder("b", 2)), Registration::New);

        assert_eq!(reg.len(), 2);
    }

    // =====================================================================
    // release()
    // =====================================================================

    #[test]
    fn test_release_holder_frees_pin() {
        let mut reg = SessionRegistry::new();
        reg.register(pin("1234"), holder("a", 1));

        let released = reg.release(&DeviceId::new("a"), ConnectionId::new(1));

        assert_eq!(released, vec![pin("1234")]);
        assert!(reg.is_empty());
        assert_eq!(reg.register(pin("1234"), holder("b", 2)), Registration::New);
    }

    #[test]
    fn test_release_non_holder_is_noop() {
        let mut reg = SessionRegistry::new();
        reg.register(pin("1234"), holder("a", 1));
        reg.register(pin("1234"), holder("b", 2));

        // Device A was displaced; its logout must not free B's session.
        let released = reg.release(&DeviceId::new("a"), ConnectionId::new(1));

        assert!(released.is_empty());
        assert_eq!(reg.get(&pin("1234")).unwrap().holder, holder("b", 2));
    }

    #[test]
    fn test_release_twice_is_idempotent() {
        let mut reg = SessionRegistry::new();
        reg.register(pin("1234"), holder("a", 1));

        reg.release(&DeviceId::new("a"), ConnectionId::new(1));
        let second = reg.release(&DeviceId::new("a"), ConnectionId::new(1));

        assert!(second.is_empty());
    }

    #[test]
    fn test_release_from_other_connection_of_same_device_is_noop() {
        let mut reg = SessionRegistry::new();
        reg.register(pin("1234"), holder("a", 1));

        let released = reg.release(&DeviceId::new("a"), ConnectionId::new(9));

        assert!(released.is_empty());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_release_frees_all_pins_of_device() {
        let mut reg = SessionRegistry::new();
        reg.register(pin("1111"), holder("a", 1));
        reg.register(pin("2222"), holder("a", 1));

        let mut released =
            reg.release(&DeviceId::new("a"), ConnectionId::new(1));
        released.sort_by(|x, y| x.as_str().cmp(y.as_str()));

        assert_eq!(released, vec![pin("1111"), pin("2222")]);
        assert!(reg.is_empty());
    }

    // =====================================================================
    // touch() / expire_stale()
    // =====================================================================

    #[test]
    fn test_touch_counts_only_sessions_on_that_connection() {
        let mut reg = SessionRegistry::new();
        reg.register(pin("1111"), holder("a", 1));
        reg.register(pin("2222"), holder("a", 2));

        assert_eq!(reg.touch(&DeviceId::new("a"), ConnectionId::new(1)), 1);
        assert_eq!(reg.touch(&DeviceId::new("zzz"), ConnectionId::new(1)), 0);
    }

    #[test]
    fn test_expire_stale_zero_timeout_frees_everything() {
        let mut reg = SessionRegistry::new();
        reg.register(pin("1111"), holder("a", 1));
        reg.register(pin("2222"), holder("b", 2));

        let expired = reg.expire_stale(Duration::ZERO);

        assert_eq!(expired.len(), 2);
        assert!(reg.is_empty());
        assert!(reg.pins_held_by(&DeviceId::new("a")).is_empty());
    }

    #[test]
    fn test_expire_stale_long_timeout_keeps_sessions() {
        let mut reg = SessionRegistry::new();
        reg.register(pin("1111"), holder("a", 1));

        let expired = reg.expire_stale(Duration::from_secs(3600));

        assert!(expired.is_empty());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_expire_stale_returns_holder_for_notification() {
        let mut reg = SessionRegistry::new();
        reg.register(pin("1234"), holder("a", 7));

        let expired = reg.expire_stale(Duration::ZERO);

        assert_eq!(expired[0].holder.connection, ConnectionId::new(7));
        assert_eq!(expired[0].pin, pin("1234"));
    }
}
