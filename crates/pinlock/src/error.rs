//! Unified error type for Pinlock.

use pinlock_client::ClientError;
use pinlock_protocol::ProtocolError;
use pinlock_session::SessionError;
use pinlock_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `pinlock` meta-crate, you deal with this single error
/// type instead of importing errors from each sub-crate.
#[derive(Debug, thiserror::Error)]
pub enum PinlockError {
    /// A transport-level error (bind, connection, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, invalid message).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (bad PIN, unknown credential).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A device-side error (validation, connectivity, identity store).
    #[error(transparent)]
    Client(#[from] ClientError),
}

#[cfg(test)]
mod tests {
    use pinlock_protocol::PinError;

    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let pinlock_err: PinlockError = err.into();
        assert!(matches!(pinlock_err, PinlockError::Transport(_)));
        assert!(pinlock_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = serde_json::from_slice::<u32>(b"nope").unwrap_err();
        let pinlock_err: PinlockError = ProtocolError::Decode(err).into();
        assert!(matches!(pinlock_err, PinlockError::Protocol(_)));
        assert!(pinlock_err.to_string().starts_with("decode failed"));
    }

    #[test]
    fn test_from_session_error() {
        let err = SessionError::AuthFailed("Invalid PIN".into());
        let pinlock_err: PinlockError = err.into();
        assert!(matches!(pinlock_err, PinlockError::Session(_)));
        assert!(pinlock_err.to_string().contains("Invalid PIN"));
    }

    #[test]
    fn test_from_client_error() {
        let err = ClientError::Validation(PinError::TooShort { len: 2, min: 4 });
        let pinlock_err: PinlockError = err.into();
        assert!(matches!(pinlock_err, PinlockError::Client(_)));
        assert!(pinlock_err.to_string().contains("at least 4"));
    }
}
