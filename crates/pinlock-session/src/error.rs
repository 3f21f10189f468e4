//! Error types for the session layer.

use pinlock_protocol::PinError;

/// Errors the authority's session layer can report.
///
/// These are all refusals of a registration or verification request; they
/// never leave the session table in a modified state.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The PIN is well-formed but does not match a stored credential.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The PIN does not satisfy the format rules.
    #[error("invalid PIN: {0}")]
    InvalidPin(#[from] PinError),
}
