//! The device-side session state machine.
//!
//! Pure and synchronous: every input (a user intent or a channel event)
//! returns a [`Transition`] describing what to send, what to tell the user
//! and whether to cycle the connection. The runtime in
//! [`SessionClient`](crate::SessionClient) carries those out.
//!
//! ```text
//!              submit_pin (valid, connected)
//!   LoggedOut ────────────────────────────────→ Pending
//!       ↑                                         │
//!       │ session-error (via Rejected)            │ session-registered
//!       ├─────────────────────────────────────────┤
//!       │                                         ↓
//!       │  force-logout / logout / link lost    Active
//!       └─────────────────────────────────────────┘
//! ```

use std::fmt;

use pinlock_protocol::{
    ClientMessage, DeviceId, DeviceSummary, ForceLogoutReason, Pin,
    ServerMessage,
};

use crate::{ChannelEvent, ClientError};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Where the device's session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSessionState {
    /// No session held, nothing in flight.
    LoggedOut,
    /// A registration has been sent and not answered.
    Pending,
    /// The authority confirmed this device holds the PIN.
    Active,
    /// The authority refused the PIN. Passed through on the way back to
    /// `LoggedOut`.
    Rejected,
}

impl fmt::Display for ClientSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LoggedOut => "logged out",
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Rejected => "rejected",
        })
    }
}

/// How a successful registration related to the previous holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationKind {
    /// Nobody held the PIN.
    New,
    /// This device already held it.
    Refreshed,
    /// Another device held it and has been logged out.
    TakenOver { previous: Option<DeviceSummary> },
}

impl RegistrationKind {
    fn from_flags(
        is_new: bool,
        is_same_device: bool,
        previous: Option<DeviceSummary>,
    ) -> Self {
        if is_new {
            Self::New
        } else if is_same_device {
            Self::Refreshed
        } else {
            Self::TakenOver { previous }
        }
    }
}

// ---------------------------------------------------------------------------
// Notices
// ---------------------------------------------------------------------------

/// Something the user should be told. Each authority event produces at
/// most one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The session is now active.
    Registered(RegistrationKind),

    /// The authority refused the PIN.
    Rejected { message: String },

    /// The authority ended this device's session.
    ForcedOut {
        reason: ForceLogoutReason,
        new_device: Option<DeviceSummary>,
    },

    /// The user logged out.
    LoggedOut,

    /// The link dropped while a session was held or pending; the session
    /// is gone and must be re-entered.
    ConnectionLost,

    /// Every reconnect attempt failed. Call
    /// [`SessionClient::retry`](crate::SessionClient::retry) to try again.
    ConnectivityExhausted,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registered(RegistrationKind::New) => {
                f.write_str("Session started")
            }
            Self::Registered(RegistrationKind::Refreshed) => {
                f.write_str("Session refreshed on this device")
            }
            Self::Registered(RegistrationKind::TakenOver {
                previous: Some(prev),
            }) => write!(f, "New device detected. Previous device: {}", prev.device_label),
            Self::Registered(RegistrationKind::TakenOver { previous: None }) => {
                f.write_str("New device detected")
            }
            Self::Rejected { message } => write!(f, "Login failed: {message}"),
            Self::ForcedOut {
                reason: ForceLogoutReason::SameDevice,
                ..
            } => f.write_str("Session terminated - New login from this device"),
            Self::ForcedOut {
                reason: ForceLogoutReason::DifferentDevice,
                new_device: Some(dev),
            } => write!(f, "Session terminated - New login from: {}", dev.device_label),
            Self::ForcedOut {
                reason: ForceLogoutReason::DifferentDevice,
                new_device: None,
            } => f.write_str("Session terminated - New login from another device"),
            Self::ForcedOut {
                reason: ForceLogoutReason::SessionExpired,
                ..
            } => f.write_str("Session expired"),
            Self::LoggedOut => f.write_str("Logged out successfully"),
            Self::ConnectionLost => f.write_str("Connection lost - please log in again"),
            Self::ConnectivityExhausted => {
                f.write_str("Unable to reach the server")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// What the runtime must do after an input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    /// Message to send on the channel.
    pub outbound: Option<ClientMessage>,
    /// What to tell the user.
    pub notice: Option<Notice>,
    /// Drop the connection and dial a fresh one.
    pub reconnect: bool,
    /// A state passed through before the current one.
    pub via: Option<ClientSessionState>,
}

impl Transition {
    fn none() -> Self {
        Self::default()
    }

    fn notice(notice: Notice) -> Self {
        Self {
            notice: Some(notice),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// SessionStateMachine
// ---------------------------------------------------------------------------

/// Device-side session logic.
#[derive(Debug)]
pub struct SessionStateMachine {
    device_id: DeviceId,
    device_label: String,
    state: ClientSessionState,
    pin: Option<Pin>,
    connected: bool,
    /// Set after a force-logout until the fresh connection is up, so the
    /// displaced connection can never carry a new registration.
    awaiting_reconnect: bool,
}

impl SessionStateMachine {
    pub fn new(device_id: DeviceId, device_label: impl Into<String>) -> Self {
        Self {
            device_id,
            device_label: device_label.into(),
            state: ClientSessionState::LoggedOut,
            pin: None,
            connected: false,
            awaiting_reconnect: false,
        }
    }

    pub fn state(&self) -> ClientSessionState {
        self.state
    }

    /// The PIN held or in flight. `None` when logged out.
    pub fn pin(&self) -> Option<&Pin> {
        self.pin.as_ref()
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// `true` if a submission would be sent right now.
    pub fn can_submit(&self) -> bool {
        self.state == ClientSessionState::LoggedOut
            && self.connected
            && !self.awaiting_reconnect
    }

    // --- User intents ---

    /// Starts a registration for `raw`.
    ///
    /// # Errors
    /// - `InvalidState` if a session is pending or active
    /// - `Validation` if `raw` is not a well-formed PIN (nothing is sent)
    /// - `Connectivity` if there is no usable connection
    pub fn submit_pin(&mut self, raw: &str) -> Result<Transition, ClientError> {
        if self.state != ClientSessionState::LoggedOut {
            return Err(ClientError::InvalidState {
                action: "submit a PIN",
                state: self.state,
            });
        }
        let pin = Pin::parse(raw)?;
        if !self.connected {
            return Err(ClientError::Connectivity("no connection to the server"));
        }
        if self.awaiting_reconnect {
            return Err(ClientError::Connectivity("reconnecting after logout"));
        }

        tracing::debug!(device_id = %self.device_id.short(), "submitting PIN");
        self.state = ClientSessionState::Pending;
        self.pin = Some(pin.clone());
        Ok(Transition {
            outbound: Some(ClientMessage::RegisterSession {
                pin,
                device_id: self.device_id.clone(),
                device_label: self.device_label.clone(),
            }),
            ..Transition::none()
        })
    }

    /// Releases the session.
    ///
    /// Also allowed while `Pending`: the logout is sent after the
    /// registration on the same connection, so the authority releases
    /// whatever it committed.
    ///
    /// # Errors
    /// `InvalidState` if nothing is held or pending.
    pub fn logout(&mut self) -> Result<Transition, ClientError> {
        match self.state {
            ClientSessionState::Active | ClientSessionState::Pending => {
                self.clear();
                tracing::debug!(device_id = %self.device_id.short(), "logging out");
                Ok(Transition {
                    outbound: Some(ClientMessage::ManualLogout {
                        device_id: self.device_id.clone(),
                    }),
                    notice: Some(Notice::LoggedOut),
                    ..Transition::none()
                })
            }
            state => Err(ClientError::InvalidState {
                action: "log out",
                state,
            }),
        }
    }

    // --- Channel events ---

    pub fn on_channel_event(&mut self, event: ChannelEvent) -> Transition {
        match event {
            ChannelEvent::Connected => {
                self.connected = true;
                self.awaiting_reconnect = false;
                Transition::none()
            }
            ChannelEvent::Disconnected { terminal } => {
                self.connected = false;
                let held = self.drop_session();
                if terminal {
                    Transition::notice(Notice::ConnectivityExhausted)
                } else if held {
                    Transition::notice(Notice::ConnectionLost)
                } else {
                    Transition::none()
                }
            }
            ChannelEvent::LivenessLost => {
                self.connected = false;
                if self.drop_session() {
                    Transition::notice(Notice::ConnectionLost)
                } else {
                    Transition::none()
                }
            }
            ChannelEvent::Message(msg) => self.on_message(msg),
        }
    }

    fn on_message(&mut self, msg: ServerMessage) -> Transition {
        use ClientSessionState::*;

        match (self.state, msg) {
            (
                Pending,
                ServerMessage::SessionRegistered {
                    is_new,
                    is_same_device,
                    previous_device,
                },
            ) => {
                self.state = Active;
                let kind =
                    RegistrationKind::from_flags(is_new, is_same_device, previous_device);
                tracing::info!(device_id = %self.device_id.short(), ?kind, "session active");
                Transition::notice(Notice::Registered(kind))
            }

            (Pending, ServerMessage::SessionError { message }) => {
                self.clear();
                tracing::info!(%message, "registration refused");
                Transition {
                    notice: Some(Notice::Rejected { message }),
                    via: Some(Rejected),
                    ..Transition::none()
                }
            }

            (
                Active,
                ServerMessage::ForceLogout {
                    reason,
                    new_device_details,
                },
            ) => {
                self.clear();
                self.awaiting_reconnect = true;
                tracing::info!(%reason, "session ended by authority");
                Transition {
                    notice: Some(Notice::ForcedOut {
                        reason,
                        new_device: new_device_details,
                    }),
                    reconnect: true,
                    ..Transition::none()
                }
            }

            // The authority answers a registration before queuing any
            // force-logout for it, so one seen while Pending targets an
            // earlier session.
            (state, ServerMessage::ForceLogout { reason, .. }) => {
                tracing::debug!(%reason, %state, "stale force-logout, ignoring");
                Transition::none()
            }

            (state, other) => {
                let violation = ClientError::ProtocolViolation(format!(
                    "{} while {state}",
                    other.kind()
                ));
                tracing::warn!(error = %violation, "dropping message");
                Transition::none()
            }
        }
    }

    /// Clears a pending or active session. `true` if there was one.
    fn drop_session(&mut self) -> bool {
        match self.state {
            ClientSessionState::Pending | ClientSessionState::Active => {
                self.clear();
                true
            }
            _ => false,
        }
    }

    fn clear(&mut self) {
        self.state = ClientSessionState::LoggedOut;
        self.pin = None;
    }
}
