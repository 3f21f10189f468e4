//! PIN session arbitration for Pinlock.
//!
//! This crate is the authority's source of truth:
//!
//! 1. **Credential checks**: is this PIN acceptable ([`PinVerifier`])
//! 2. **Arbitration**: which single device holds each PIN
//!    ([`SessionRegistry`], made concurrent by [`SessionTable`])
//! 3. **Liveness**: holders that stop heartbeating are expired and their
//!    PIN freed
//!
//! # How it fits in the stack
//!
//! ```text
//! Authority (pinlock)   ← routes messages, fans out force-logout notices
//!     ↕
//! Session Layer (this crate)  ← PIN → holder, commit order, expiry
//!     ↕
//! Protocol Layer (below)  ← provides Pin, DeviceId
//! ```

mod error;
mod registry;
mod session;
mod table;
mod verifier;

pub use error::SessionError;
pub use registry::SessionRegistry;
pub use session::{Holder, Registration, Session, SessionConfig};
pub use table::SessionTable;
pub use verifier::{AllowList, FormatOnly, PinVerifier};
