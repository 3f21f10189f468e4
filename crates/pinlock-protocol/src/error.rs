//! Error types for the protocol layer.
//!
//! Each crate in Pinlock defines its own error enum. A `ProtocolError`
//! means the problem is in serialization or message shape, not in
//! networking or session arbitration.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust type).
    ///
    /// Common causes: malformed JSON, missing required fields, an unknown
    /// message `type`, or truncated frames.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),
}

/// Why a PIN failed local validation.
///
/// This is cheap client-side filtering only; the authority performs the
/// authoritative check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PinError {
    /// Nothing was entered.
    #[error("PIN is required")]
    Empty,

    /// The PIN contains something other than ASCII digits.
    #[error("PIN must contain digits only")]
    NonNumeric,

    /// The PIN has fewer digits than [`MIN_PIN_LEN`](crate::MIN_PIN_LEN).
    #[error("PIN must be at least {min} digits, got {len}")]
    TooShort { len: usize, min: usize },
}
