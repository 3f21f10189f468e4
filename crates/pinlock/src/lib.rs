//! # Pinlock
//!
//! One active session per PIN, across every device.
//!
//! A PIN identifies a logical session. Any number of devices may try to
//! use it, but at any moment at most one device holds it. When another
//! device logs in with the same PIN, the [`ArbitrationAuthority`] commits
//! the new holder and tells the previous one to log out. Devices prove
//! liveness with heartbeats; a holder that goes quiet loses its session.
//!
//! This meta crate runs the authority and re-exports the device side
//! ([`pinlock_client`]) so one dependency covers both ends.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pinlock::prelude::*;
//!
//! # async fn run() -> Result<(), PinlockError> {
//! let authority = AuthorityBuilder::new()
//!     .bind("0.0.0.0:8080")
//!     .build(AllowList::new(["1234"])?)
//!     .await?;
//! authority.run().await
//! # }
//! ```

mod error;
mod handler;
mod routes;
mod server;

pub use error::PinlockError;
pub use server::{ArbitrationAuthority, AuthorityBuilder};

pub use pinlock_client as client;
pub use pinlock_protocol as protocol;
pub use pinlock_session as session;
pub use pinlock_transport as transport;

/// Everything needed to run an authority or a device.
pub mod prelude {
    pub use crate::{ArbitrationAuthority, AuthorityBuilder, PinlockError};

    pub use pinlock_client::{
        ChannelConfig, ClientError, ClientSessionState, ConnectionState,
        DeviceDetails, DeviceIdentity, FileDeviceIdStore, MemoryDeviceIdStore,
        Notice, RegistrationKind, SessionClient, verify_pin,
    };
    pub use pinlock_protocol::{
        ClientMessage, DeviceId, DeviceSummary, Envelope, ForceLogoutReason,
        Pin, ServerMessage,
    };
    pub use pinlock_session::{
        AllowList, FormatOnly, PinVerifier, SessionConfig, SessionError,
    };
    pub use pinlock_transport::WebSocketConnector;
}
