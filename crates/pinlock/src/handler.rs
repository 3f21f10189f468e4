//! Per-connection handler: registration, logout, heartbeats and one-shot
//! verification.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The task owns the socket. It:
//!   1. registers an outbox in the route table (removed on every exit path)
//!   2. loops over inbound frames, queued outbound messages and an idle
//!      deadline
//!   3. writes everything queued for this connection in queue order,
//!      whether it is a direct reply or a fan-out notification

use std::sync::Arc;

use pinlock_protocol::{
    ClientMessage, Codec, DeviceId, Envelope, ForceLogoutReason, Pin,
    Sequencer, ServerMessage,
};
use pinlock_session::{Holder, PinVerifier, Registration, SessionError};
use pinlock_transport::{Connection, ConnectionId};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::PinlockError;
use crate::routes::Outbox;
use crate::server::AuthorityState;

/// Undecodable frames tolerated in a row before the connection is closed.
const MAX_BAD_FRAMES: u32 = 3;

/// Removes the connection's outbox from the route table when the handler
/// exits.
///
/// Sessions this connection holds are not released here: a holder that
/// vanished is freed by the heartbeat-timeout sweeper, which leaves room
/// for the device to come back on a new connection.
struct RouteGuard<V: PinVerifier, C: Codec> {
    conn_id: ConnectionId,
    state: Arc<AuthorityState<V, C>>,
}

impl<V: PinVerifier, C: Codec> Drop for RouteGuard<V, C> {
    fn drop(&mut self) {
        self.state.routes.remove(self.conn_id);
    }
}

/// Per-connection bookkeeping.
struct Peer {
    conn_id: ConnectionId,
    outbox: Outbox,
    /// The device that registered through this connection, once one has.
    device: Option<DeviceId>,
}

impl Peer {
    fn reply(&self, message: ServerMessage) {
        // Only fails once the receiver is gone, i.e. the handler is exiting.
        let _ = self.outbox.send(message);
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<K, V, C>(
    conn: K,
    state: Arc<AuthorityState<V, C>>,
) -> Result<(), PinlockError>
where
    K: Connection,
    V: PinVerifier,
    C: Codec,
{
    let conn_id = conn.id();
    tracing::debug!(%conn_id, "handling new connection");

    let (outbox, mut queued) = mpsc::unbounded_channel();
    state.routes.insert(conn_id, outbox.clone());
    let _guard = RouteGuard {
        conn_id,
        state: Arc::clone(&state),
    };

    let mut peer = Peer {
        conn_id,
        outbox,
        device: None,
    };
    let mut seq = Sequencer::new();
    let mut bad_frames = 0u32;

    let idle = tokio::time::sleep(state.idle_timeout());
    tokio::pin!(idle);

    let result = loop {
        tokio::select! {
            _ = &mut idle => {
                tracing::info!(%conn_id, "connection idle, closing");
                expire_idle(&state, &peer, &conn, &mut seq, &mut queued).await;
                break Ok(());
            }

            Some(message) = queued.recv() => {
                let kind = message.kind();
                let bytes = state.codec.encode(&seq.wrap(message))?;
                if let Err(e) = conn.send(&bytes).await {
                    tracing::debug!(%conn_id, kind, error = %e, "send failed");
                    break Err(e.into());
                }
            }

            inbound = conn.recv() => {
                let data = match inbound {
                    Ok(Some(data)) => data,
                    Ok(None) => {
                        tracing::info!(%conn_id, "connection closed cleanly");
                        break Ok(());
                    }
                    Err(e) => {
                        tracing::debug!(%conn_id, error = %e, "recv error");
                        break Err(e.into());
                    }
                };
                idle.as_mut().reset(Instant::now() + state.idle_timeout());

                let envelope: Envelope<ClientMessage> = match state.codec.decode(&data) {
                    Ok(env) => env,
                    Err(e) => {
                        bad_frames += 1;
                        tracing::debug!(
                            %conn_id, error = %e, bad_frames,
                            "failed to decode envelope"
                        );
                        if bad_frames >= MAX_BAD_FRAMES {
                            break Err(e.into());
                        }
                        continue;
                    }
                };
                bad_frames = 0;

                handle_message(&state, &mut peer, envelope.message).await;
            }
        }
    };

    let _ = conn.close().await;
    // _guard drops here → route removed.
    result
}

/// Expires the sessions an idle connection holds and writes the resulting
/// `force-logout`, plus anything the sweeper queued meanwhile, before the
/// socket closes.
async fn expire_idle<K, V, C>(
    state: &AuthorityState<V, C>,
    peer: &Peer,
    conn: &K,
    seq: &mut Sequencer,
    queued: &mut mpsc::UnboundedReceiver<ServerMessage>,
) where
    K: Connection,
    V: PinVerifier,
    C: Codec,
{
    let expired = match &peer.device {
        Some(device_id) => state.sessions.release(device_id, peer.conn_id).await,
        None => Vec::new(),
    };

    let mut last_words = Vec::new();
    while let Ok(message) = queued.try_recv() {
        last_words.push(message);
    }
    if !expired.is_empty() {
        tracing::info!(
            conn_id = %peer.conn_id,
            count = expired.len(),
            "idle holder expired"
        );
        last_words.push(ServerMessage::ForceLogout {
            reason: ForceLogoutReason::SessionExpired,
            new_device_details: None,
        });
    }

    for message in last_words {
        let bytes = match state.codec.encode(&seq.wrap(message)) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(conn_id = %peer.conn_id, error = %e, "encode failed");
                continue;
            }
        };
        if conn.send(&bytes).await.is_err() {
            break;
        }
    }
}

async fn handle_message<V: PinVerifier, C: Codec>(
    state: &AuthorityState<V, C>,
    peer: &mut Peer,
    message: ClientMessage,
) {
    let conn_id = peer.conn_id;
    match message {
        ClientMessage::RegisterSession {
            pin,
            device_id,
            device_label,
        } => {
            register(state, peer, pin, device_id, device_label).await;
        }

        ClientMessage::ManualLogout { device_id } => {
            let released = state.sessions.release(&device_id, conn_id).await;
            tracing::info!(
                %conn_id,
                device_id = %device_id.short(),
                released = released.len(),
                "manual logout"
            );
        }

        ClientMessage::Heartbeat {} => {
            if let Some(device_id) = &peer.device {
                state.sessions.touch(device_id, conn_id).await;
            }
            peer.reply(ServerMessage::HeartbeatAck {});
        }

        ClientMessage::VerifyPin { pin } => {
            let reply = match state.verifier.verify(&pin).await {
                Ok(()) => ServerMessage::PinVerification {
                    valid: true,
                    message: None,
                },
                Err(e) => ServerMessage::PinVerification {
                    valid: false,
                    message: Some(rejection_message(&e)),
                },
            };
            tracing::debug!(%conn_id, "verify-pin answered");
            peer.reply(reply);
        }
    }
}

async fn register<V: PinVerifier, C: Codec>(
    state: &AuthorityState<V, C>,
    peer: &mut Peer,
    pin: Pin,
    device_id: DeviceId,
    device_label: String,
) {
    let conn_id = peer.conn_id;

    if let Some(bound) = &peer.device {
        if *bound != device_id {
            tracing::warn!(
                %conn_id,
                bound = %bound.short(),
                claimed = %device_id.short(),
                "registration for a second device on one connection"
            );
            peer.reply(ServerMessage::SessionError {
                message: "Connection already belongs to another device".into(),
            });
            return;
        }
    }

    if let Err(e) = state.verifier.verify(&pin).await {
        tracing::info!(%conn_id, device_id = %device_id.short(), error = %e, "registration refused");
        peer.reply(ServerMessage::SessionError {
            message: rejection_message(&e),
        });
        return;
    }

    let holder = Holder {
        device_id: device_id.clone(),
        device_label,
        connection: conn_id,
    };
    let summary = holder.summary();

    let outcome = state
        .sessions
        .register(pin, holder, |outcome| {
            // Runs under the PIN's shard lock: notifications for this PIN
            // are queued in commit order.
            let registered = match outcome {
                Registration::New => ServerMessage::SessionRegistered {
                    is_new: true,
                    is_same_device: false,
                    previous_device: None,
                },
                Registration::Refreshed => ServerMessage::SessionRegistered {
                    is_new: false,
                    is_same_device: true,
                    previous_device: None,
                },
                Registration::SameDeviceElsewhere { previous } => {
                    state.routes.deliver(
                        previous.connection,
                        ServerMessage::ForceLogout {
                            reason: ForceLogoutReason::SameDevice,
                            new_device_details: Some(summary.clone()),
                        },
                    );
                    ServerMessage::SessionRegistered {
                        is_new: false,
                        is_same_device: true,
                        previous_device: None,
                    }
                }
                Registration::TakenOver { previous } => {
                    state.routes.deliver(
                        previous.connection,
                        ServerMessage::ForceLogout {
                            reason: ForceLogoutReason::DifferentDevice,
                            new_device_details: Some(summary.clone()),
                        },
                    );
                    ServerMessage::SessionRegistered {
                        is_new: false,
                        is_same_device: false,
                        previous_device: Some(previous.summary()),
                    }
                }
            };
            peer.reply(registered);
        })
        .await;

    if let Some(previous) = outcome.displaced() {
        tracing::info!(
            %conn_id,
            device_id = %device_id.short(),
            displaced = %previous.device_id.short(),
            displaced_conn = %previous.connection,
            "session taken over"
        );
    }
    peer.device = Some(device_id);
}

/// The text shown to a device whose PIN was refused.
fn rejection_message(e: &SessionError) -> String {
    match e {
        SessionError::AuthFailed(message) => message.clone(),
        SessionError::InvalidPin(e) => e.to_string(),
    }
}
