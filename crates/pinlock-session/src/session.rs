//! Session types: the authority's record of who holds a PIN.
//!
//! A session answers three questions for one PIN:
//! - WHO holds it (`Holder`: device, label, and the connection that
//!   committed the registration)
//! - WHEN it was (re-)registered
//! - WHEN the holder was last heard from (heartbeats)

use std::time::{Duration, SystemTime};

use pinlock_protocol::{DeviceId, DeviceSummary, Pin};
use pinlock_transport::ConnectionId;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Configuration for the authority's session table.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a holder may go without a heartbeat before its session is
    /// cleared and the PIN freed.
    ///
    /// Default: 30 seconds (twice the client heartbeat interval).
    pub heartbeat_timeout: Duration,

    /// Number of independently locked shards. Registrations for one PIN
    /// always land on the same shard.
    ///
    /// Default: 16. Values below 1 are treated as 1.
    pub shard_count: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            shard_count: 16,
        }
    }
}

// ---------------------------------------------------------------------------
// Holder
// ---------------------------------------------------------------------------

/// The device currently authorized under a PIN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holder {
    /// Durable identity of the device.
    pub device_id: DeviceId,

    /// Label the device registered with; shown to the device it displaces.
    pub device_label: String,

    /// The connection the registration arrived on. Fan-out notifications
    /// for this session are routed here.
    pub connection: ConnectionId,
}

impl Holder {
    /// The summary other devices are told about.
    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            device_id: self.device_id.clone(),
            device_label: self.device_label.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One committed session. At most one exists per PIN.
#[derive(Debug, Clone)]
pub struct Session {
    /// The PIN this session is keyed by.
    pub pin: Pin,

    /// Who holds it.
    pub holder: Holder,

    /// Wall-clock time of the last (re-)registration.
    pub registered_at: SystemTime,

    /// Last time the holder connection was heard from. Tokio's clock, so
    /// expiry follows paused test time.
    pub last_seen: Instant,
}

impl Session {
    /// `true` if the holder has not been seen within `timeout`.
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() >= timeout
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// What a committed registration replaced.
///
/// ```text
///   no holder ──────────────────────────→ New
///   same device, same connection ───────→ Refreshed
///   same device, other connection ──────→ SameDeviceElsewhere
///   different device ───────────────────→ TakenOver
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// Nobody held the PIN.
    New,

    /// The registering connection already held the PIN. Benign refresh,
    /// not a conflict.
    Refreshed,

    /// The same device held the PIN through another connection (a second
    /// window, or a connection that has not been reaped yet). That
    /// connection is displaced.
    SameDeviceElsewhere { previous: Holder },

    /// Another device held the PIN and is displaced.
    TakenOver { previous: Holder },
}

impl Registration {
    /// The holder that lost the session, if one did.
    pub fn displaced(&self) -> Option<&Holder> {
        match self {
            Self::New | Self::Refreshed => None,
            Self::SameDeviceElsewhere { previous }
            | Self::TakenOver { previous } => Some(previous),
        }
    }
}
