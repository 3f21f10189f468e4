//! Wire protocol for Pinlock.
//!
//! This crate defines the language devices and the arbitration authority
//! speak:
//!
//! - **Types** ([`Envelope`], [`ClientMessage`], [`ServerMessage`], [`Pin`],
//!   [`DeviceId`], ...): the structures that travel on the wire.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how those messages are
//!   converted to and from bytes.
//! - **Errors** ([`ProtocolError`], [`PinError`]).
//!
//! ```text
//! Transport (bytes) → Protocol (Envelope) → Session (PIN arbitration)
//! ```

mod codec;
mod error;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::{PinError, ProtocolError};
pub use types::{
    ClientMessage, DeviceId, DeviceSummary, Envelope, ForceLogoutReason,
    MIN_PIN_LEN, Pin, Sequencer, ServerMessage,
};
