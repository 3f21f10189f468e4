//! Device side of Pinlock.
//!
//! A device holds at most one session per PIN, and the authority may take
//! it away at any time. This crate keeps the device's view consistent with
//! that:
//!
//! - [`identity`](DeviceIdentity): a durable device id plus a
//!   human-readable label
//! - [`SessionChannel`]: a reconnecting, heartbeating link to the
//!   authority
//! - [`SessionStateMachine`]: pure session logic (`LoggedOut → Pending →
//!   Active`)
//! - [`SessionClient`]: the runtime tying them together
//!
//! ```rust,no_run
//! use pinlock_client::{
//!     ChannelConfig, DeviceIdentity, FileDeviceIdStore, MemoryDeviceIdStore,
//!     SessionClient,
//! };
//! use pinlock_transport::WebSocketConnector;
//!
//! # async fn run() -> Result<(), pinlock_client::ClientError> {
//! let identity = match FileDeviceIdStore::default_location() {
//!     Some(store) => DeviceIdentity::load(&store)?,
//!     None => DeviceIdentity::load(&MemoryDeviceIdStore::new())?,
//! };
//! let connector = WebSocketConnector::new("ws://127.0.0.1:8080");
//! let (client, mut notices) =
//!     SessionClient::start(connector, identity, ChannelConfig::default());
//!
//! client.submit_pin("1234").await?;
//! while let Some(notice) = notices.recv().await {
//!     println!("{notice}");
//! }
//! # Ok(())
//! # }
//! ```

mod channel;
mod client;
mod error;
mod identity;
mod machine;
#[cfg(test)]
mod testing;

pub use channel::{
    ChannelConfig, ChannelEvent, ChannelStatus, ConnectionState, SessionChannel,
};
pub use client::{SessionClient, verify_pin};
pub use error::ClientError;
pub use identity::{
    DeviceDetails, DeviceIdStore, DeviceIdentity, DeviceType,
    FileDeviceIdStore, MemoryDeviceIdStore, device_label, generate_device_id,
    get_or_create_device_id,
};
pub use machine::{
    ClientSessionState, Notice, RegistrationKind, SessionStateMachine,
    Transition,
};
