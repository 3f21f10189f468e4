//! Core protocol types for Pinlock's wire format.
//!
//! Every type here travels on the wire between a device and the
//! arbitration authority. Messages are adjacently tagged so the JSON reads
//! as `{ "type": "register-session", "payload": { ... } }`, which is the
//! shape browser clients already speak.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::PinError;

/// Minimum number of digits a PIN must have before a device will submit it.
pub const MIN_PIN_LEN: usize = 4;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Opaque, durable identifier of one client installation.
///
/// Generated once per installation and never changed. The authority only
/// compares ids for equality; it never interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wraps an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first eight characters, for display next to a device label.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The numeric credential that identifies a logical session.
///
/// `Debug` and `Display` never print the digits, so a `Pin` can sit inside
/// logged structures without leaking.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pin(String);

impl Pin {
    /// Parses user input into a PIN.
    ///
    /// Surrounding whitespace is ignored. The result is all ASCII digits
    /// and at least [`MIN_PIN_LEN`] long.
    pub fn parse(raw: &str) -> Result<Self, PinError> {
        let pin = Self(raw.trim().to_string());
        pin.validate()?;
        Ok(pin)
    }

    /// Checks the format rules on a PIN that arrived over the wire.
    pub fn validate(&self) -> Result<(), PinError> {
        if self.0.is_empty() {
            return Err(PinError::Empty);
        }
        if !self.0.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PinError::NonNumeric);
        }
        if self.0.len() < MIN_PIN_LEN {
            return Err(PinError::TooShort {
                len: self.0.len(),
                min: MIN_PIN_LEN,
            });
        }
        Ok(())
    }

    /// Returns the digits.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin(****)")
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("****")
    }
}

/// A device as reported to other devices: who took over, or who was
/// displaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub device_id: DeviceId,
    pub device_label: String,
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.device_label, self.device_id.short())
    }
}

/// Why the authority ended a device's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForceLogoutReason {
    /// The same device registered the PIN again from another connection.
    SameDevice,
    /// Another device registered the PIN.
    DifferentDevice,
    /// The authority stopped seeing heartbeats from the holder.
    SessionExpired,
}

impl fmt::Display for ForceLogoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SameDevice => "same-device",
            Self::DifferentDevice => "different-device",
            Self::SessionExpired => "session-expired",
        })
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Messages a device sends to the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Claim the session for `pin`.
    RegisterSession {
        pin: Pin,
        device_id: DeviceId,
        device_label: String,
    },

    /// Voluntarily release the session(s) held by this device.
    ManualLogout { device_id: DeviceId },

    /// Liveness ping.
    Heartbeat {},

    /// One-shot check of a PIN. Never creates or changes a session.
    VerifyPin { pin: Pin },
}

impl ClientMessage {
    /// The wire `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RegisterSession { .. } => "register-session",
            Self::ManualLogout { .. } => "manual-logout",
            Self::Heartbeat {} => "heartbeat",
            Self::VerifyPin { .. } => "verify-pin",
        }
    }
}

/// Messages the authority sends to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Registration succeeded; the receiving device now holds the PIN.
    SessionRegistered {
        /// No device held the PIN before.
        is_new: bool,
        /// The previous holder was this same device.
        is_same_device: bool,
        /// The device that was displaced, when it was a different one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_device: Option<DeviceSummary>,
    },

    /// Registration was refused (e.g. unknown PIN).
    SessionError { message: String },

    /// This device's session has been superseded or expired.
    ForceLogout {
        reason: ForceLogoutReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_device_details: Option<DeviceSummary>,
    },

    /// Liveness pong.
    HeartbeatAck {},

    /// Outcome of a [`ClientMessage::VerifyPin`] request.
    PinVerification {
        valid: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ServerMessage {
    /// The wire `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionRegistered { .. } => "session-registered",
            Self::SessionError { .. } => "session-error",
            Self::ForceLogout { .. } => "force-logout",
            Self::HeartbeatAck {} => "heartbeat-ack",
            Self::PinVerification { .. } => "pin-verification",
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The top-level wire frame. Every WebSocket frame carries one envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<M> {
    /// Per-connection, per-sender counter starting at 1.
    pub seq: u64,

    /// Milliseconds since the sender's side of the connection started.
    pub timestamp: u64,

    /// The message itself.
    pub message: M,
}

/// Stamps outgoing messages with sequence numbers and timestamps.
///
/// One sequencer per connection per direction; a new connection starts a
/// new sequence.
#[derive(Debug)]
pub struct Sequencer {
    next: u64,
    start: Instant,
}

impl Sequencer {
    /// Starts a sequence at 1 with the clock at zero.
    pub fn new() -> Self {
        Self {
            next: 1,
            start: Instant::now(),
        }
    }

    /// Wraps `message` in the next envelope.
    pub fn wrap<M>(&mut self, message: M) -> Envelope<M> {
        let seq = self.next;
        self.next += 1;
        Envelope {
            seq,
            timestamp: self.start.elapsed().as_millis() as u64,
            message,
        }
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

// =========================================================================
// Tests
// =========================================================================
