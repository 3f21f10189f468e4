//! Error types for the device side.
//!
//! A `ClientError` is what a caller of [`SessionClient`](crate::SessionClient)
//! sees when an intent is refused. Authority events that end a session
//! (force-logout, lost liveness) are not errors; they arrive as
//! [`Notice`](crate::Notice)s.

use std::path::PathBuf;

use pinlock_protocol::{PinError, ProtocolError};
use pinlock_transport::TransportError;

use crate::ClientSessionState;

/// Errors that can occur on the device side.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The PIN failed local format checks and was not sent.
    #[error(transparent)]
    Validation(#[from] PinError),

    /// The authority refused the PIN.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The channel to the authority is down or still reconnecting.
    #[error("not connected: {0}")]
    Connectivity(&'static str),

    /// The authority sent something that makes no sense here.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The intent is not allowed in the current session state.
    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: ClientSessionState,
    },

    /// The persisted device identifier could not be read or written.
    #[error("device identity store: {0}")]
    Identity(#[from] std::io::Error),

    /// The persisted device identifier exists but is unusable. It is left
    /// in place; an operator has to remove it.
    #[error("device identity at {} is corrupt", .0.display())]
    CorruptIdentity(PathBuf),

    /// The background task driving the session has stopped.
    #[error("session client has shut down")]
    ChannelClosed,

    /// A transport failure outside the reconnecting channel.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
