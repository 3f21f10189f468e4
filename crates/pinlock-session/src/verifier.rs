//! Credential hook for validating PINs.
//!
//! The authority never decides on its own whether a PIN is valid; it asks
//! a [`PinVerifier`]. Deployments plug in their own credential store by
//! implementing the trait. Two implementations ship with the crate:
//!
//! - [`AllowList`]: a fixed set of accepted PINs (from configuration)
//! - [`FormatOnly`]: accepts any well-formed PIN (development)

use std::collections::HashSet;
use std::future::Future;

use pinlock_protocol::Pin;

use crate::SessionError;

/// Validates a PIN against stored credentials.
///
/// Verification must not create or alter session state; it is called both
/// before a registration is committed and for one-shot `verify-pin`
/// requests.
///
/// # Example
///
/// ```rust
/// use pinlock_protocol::Pin;
/// use pinlock_session::{PinVerifier, SessionError};
///
/// /// Accepts PINs whose digits sum to an even number.
/// struct EvenSum;
///
/// impl PinVerifier for EvenSum {
///     async fn verify(&self, pin: &Pin) -> Result<(), SessionError> {
///         pin.validate()?;
///         let sum: u32 = pin.as_str().bytes().map(|b| u32::from(b - b'0')).sum();
///         if sum % 2 == 0 {
///             Ok(())
///         } else {
///             Err(SessionError::AuthFailed("Invalid PIN".into()))
///         }
///     }
/// }
/// ```
pub trait PinVerifier: Send + Sync + 'static {
    /// Returns `Ok(())` if `pin` may register a session.
    ///
    /// # Errors
    /// - `SessionError::InvalidPin`: malformed PIN
    /// - `SessionError::AuthFailed`: well-formed but not a stored credential
    fn verify(
        &self,
        pin: &Pin,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;
}

/// Accepts exactly the configured PINs.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    pins: HashSet<Pin>,
}

impl AllowList {
    /// Builds an allow-list, rejecting entries that are not valid PINs.
    pub fn new<I, S>(pins: I) -> Result<Self, SessionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let pins = pins
            .into_iter()
            .map(|p| Pin::parse(p.as_ref()))
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(Self { pins })
    }

    /// Number of accepted PINs.
    pub fn len(&self) -> usize {
        self.pins.len()
    }

    /// Returns `true` if nothing would be accepted.
    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

impl PinVerifier for AllowList {
    async fn verify(&self, pin: &Pin) -> Result<(), SessionError> {
        pin.validate()?;
        if self.pins.contains(pin) {
            Ok(())
        } else {
            Err(SessionError::AuthFailed("Invalid PIN".into()))
        }
    }
}

/// Accepts any PIN that passes the format rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatOnly;

impl PinVerifier for FormatOnly {
    async fn verify(&self, pin: &Pin) -> Result<(), SessionError> {
        pin.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// PINs that arrive over the wire are decoded without validation.
    fn wire_pin(raw: &str) -> Pin {
        serde_json::from_str(&format!("\"{raw}\"")).expect("json string")
    }

    #[tokio::test]
    async fn test_allow_list_accepts_listed_pin() {
        let list = AllowList::new(["1234", "567890"]).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.verify(&wire_pin("1234")).await.is_ok());
    }

    #[tokio::test]
    async fn test_allow_list_rejects_unlisted_pin() {
        let list = AllowList::new(["1234"]).unwrap();
        let result = list.verify(&wire_pin("9999")).await;
        assert!(matches!(result, Err(SessionError::AuthFailed(_))));
    }

    #[test]
    fn test_allow_list_rejects_malformed_entries() {
        let result = AllowList::new(["12"]);
        assert!(matches!(result, Err(SessionError::InvalidPin(_))));
    }

    #[tokio::test]
    async fn test_allow_list_rejects_malformed_wire_pin_before_lookup() {
        let list = AllowList::new(["1234"]).unwrap();
        let result = list.verify(&wire_pin("12")).await;
        assert!(matches!(result, Err(SessionError::InvalidPin(_))));
    }

    #[tokio::test]
    async fn test_format_only_accepts_any_well_formed_pin() {
        assert!(FormatOnly.verify(&wire_pin("4444")).await.is_ok());
        assert!(FormatOnly.verify(&wire_pin("44x4")).await.is_err());
    }
}
