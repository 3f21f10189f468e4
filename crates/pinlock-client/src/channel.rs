//! The device's long-lived channel to the authority.
//!
//! A [`SessionChannel`] owns one background task that:
//!
//! 1. dials the authority through a [`Connector`], retrying a bounded
//!    number of times with a fixed delay
//! 2. sends a heartbeat every `heartbeat_interval` and declares the link
//!    dead when no ack arrived for `heartbeat_interval * missed_heartbeats`
//! 3. decodes inbound envelopes and forwards authority messages as
//!    [`ChannelEvent::Message`]
//! 4. on any loss, redials automatically
//!
//! The channel never re-registers a session by itself. What to do after a
//! reconnect is the state machine's decision.

use std::future::Future;
use std::time::Duration;

use pinlock_protocol::{
    ClientMessage, Codec, Envelope, JsonCodec, Sequencer, ServerMessage,
};
use pinlock_transport::{Connection, Connector};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::ClientError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Timing and retry policy for a [`SessionChannel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Dial attempts per connect cycle before giving up.
    ///
    /// Default: 5.
    pub max_connect_attempts: u32,

    /// Pause between failed dial attempts.
    ///
    /// Default: 1 second.
    pub retry_delay: Duration,

    /// Upper bound on a single dial attempt.
    ///
    /// Default: 10 seconds.
    pub connect_timeout: Duration,

    /// How often a heartbeat is sent while connected.
    ///
    /// Default: 15 seconds.
    pub heartbeat_interval: Duration,

    /// Consecutive heartbeat intervals without an ack before the link is
    /// considered dead.
    ///
    /// Default: 2.
    pub missed_heartbeats: u32,

    /// Consecutive undecodable frames tolerated before the connection is
    /// dropped and redialed.
    ///
    /// Default: 3.
    pub max_protocol_violations: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: 5,
            retry_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            missed_heartbeats: 2,
            max_protocol_violations: 3,
        }
    }
}

impl ChannelConfig {
    fn liveness_window(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats.max(1)
    }
}

// ---------------------------------------------------------------------------
// Status and events
// ---------------------------------------------------------------------------

/// Link state as seen by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot published through [`SessionChannel::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    /// When the last heartbeat ack arrived on the current connection.
    pub last_heartbeat_ack: Option<Instant>,
}

impl ChannelStatus {
    fn disconnected() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_heartbeat_ack: None,
        }
    }
}

/// What the channel reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A connection to the authority is up.
    Connected,

    /// The connection went away. `terminal` means every dial attempt of
    /// the cycle failed; the channel now waits for
    /// [`SessionChannel::reconnect`].
    Disconnected { terminal: bool },

    /// Heartbeat acks stopped arriving. The channel has dropped the
    /// connection and is redialing.
    LivenessLost,

    /// An authority message. Heartbeat acks are consumed by the channel.
    Message(ServerMessage),
}

enum ChannelCommand {
    Send(ClientMessage),
    Reconnect,
    Shutdown,
}

/// Outcome of one connect cycle.
enum Dial<T> {
    Connected(T),
    Exhausted,
    Shutdown,
}

/// Why a connected period ended.
enum Ended {
    Dropped,
    LivenessLost,
    Violations,
    Reconnect,
    Shutdown,
}

// ---------------------------------------------------------------------------
// SessionChannel
// ---------------------------------------------------------------------------

/// Handle to the background channel task.
///
/// Dropping the handle stops the task, which closes the connection.
pub struct SessionChannel {
    commands: mpsc::UnboundedSender<ChannelCommand>,
    status: watch::Receiver<ChannelStatus>,
    task: Option<JoinHandle<()>>,
}

impl SessionChannel {
    /// Starts the channel with the JSON codec.
    pub fn spawn<K: Connector>(
        connector: K,
        config: ChannelConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        Self::spawn_with_codec(connector, JsonCodec, config)
    }

    /// Starts the channel with a custom codec.
    pub fn spawn_with_codec<K: Connector, C: Codec>(
        connector: K,
        codec: C,
        config: ChannelConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ChannelStatus::disconnected());

        let task = ChannelTask {
            connector,
            codec,
            config,
            commands: cmd_rx,
            events: event_tx,
            status: status_tx,
        };
        let task = tokio::spawn(task.run());

        (
            Self {
                commands: cmd_tx,
                status: status_rx,
                task: Some(task),
            },
            event_rx,
        )
    }

    /// Queues `message` for the current connection.
    ///
    /// Messages queued while no connection is up are dropped; callers check
    /// [`status`](Self::status) or wait for [`ChannelEvent::Connected`].
    pub fn send(&self, message: ClientMessage) -> Result<(), ClientError> {
        self.commands
            .send(ChannelCommand::Send(message))
            .map_err(|_| ClientError::ChannelClosed)
    }

    /// Drops the current connection (if any) and starts a fresh connect
    /// cycle. Also restarts dialing after a terminal disconnect.
    pub fn reconnect(&self) -> Result<(), ClientError> {
        self.commands
            .send(ChannelCommand::Reconnect)
            .map_err(|_| ClientError::ChannelClosed)
    }

    /// Closes the connection and stops the task.
    pub fn shutdown(&self) {
        let _ = self.commands.send(ChannelCommand::Shutdown);
    }

    /// Current link status.
    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    /// A receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Stops the task and waits until the connection is closed.
    pub async fn close(mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Background task
// ---------------------------------------------------------------------------

struct ChannelTask<K: Connector, C: Codec> {
    connector: K,
    codec: C,
    config: ChannelConfig,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    status: watch::Sender<ChannelStatus>,
}

impl<K: Connector, C: Codec> ChannelTask<K, C> {
    async fn run(mut self) {
        loop {
            let conn = match self.connect_cycle().await {
                Dial::Connected(conn) => conn,
                Dial::Shutdown => return,
                Dial::Exhausted => {
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(ChannelEvent::Disconnected { terminal: true });
                    if self.wait_for_reconnect().await {
                        continue;
                    }
                    return;
                }
            };

            let conn_id = conn.id();
            tracing::info!(%conn_id, "connected to authority");
            self.status.send_replace(ChannelStatus {
                state: ConnectionState::Connected,
                last_heartbeat_ack: None,
            });
            self.emit(ChannelEvent::Connected);

            let ended = self.drive(&conn).await;
            let _ = conn.close().await;
            self.set_state(ConnectionState::Disconnected);

            match ended {
                Ended::Shutdown => {
                    tracing::debug!(%conn_id, "channel shut down");
                    return;
                }
                Ended::LivenessLost => {
                    tracing::warn!(%conn_id, "heartbeat acks stopped, redialing");
                    self.emit(ChannelEvent::LivenessLost);
                }
                Ended::Violations => {
                    tracing::warn!(%conn_id, "too many bad frames, redialing");
                    self.emit(ChannelEvent::Disconnected { terminal: false });
                }
                Ended::Reconnect => {
                    tracing::debug!(%conn_id, "reconnect requested");
                    self.emit(ChannelEvent::Disconnected { terminal: false });
                }
                Ended::Dropped => {
                    tracing::info!(%conn_id, "connection lost, redialing");
                    self.emit(ChannelEvent::Disconnected { terminal: false });
                }
            }
        }
    }

    async fn connect_cycle(&mut self) -> Dial<K::Connection> {
        let attempts = self.config.max_connect_attempts.max(1);
        for attempt in 1..=attempts {
            self.set_state(ConnectionState::Connecting);

            let dial = tokio::time::timeout(
                self.config.connect_timeout,
                self.connector.connect(),
            );
            let Some(outcome) = serve_commands(&mut self.commands, dial).await
            else {
                return Dial::Shutdown;
            };
            match outcome {
                Ok(Ok(conn)) => return Dial::Connected(conn),
                Ok(Err(e)) => {
                    tracing::debug!(attempt, error = %e, "connect attempt failed");
                }
                Err(_) => {
                    tracing::debug!(attempt, "connect attempt timed out");
                }
            }

            if attempt < attempts {
                let pause = tokio::time::sleep(self.config.retry_delay);
                if serve_commands(&mut self.commands, pause).await.is_none() {
                    return Dial::Shutdown;
                }
            }
        }
        tracing::warn!(attempts, "giving up on authority after repeated failures");
        Dial::Exhausted
    }

    /// Idles after a terminal disconnect. `true` means redial.
    async fn wait_for_reconnect(&mut self) -> bool {
        loop {
            match self.commands.recv().await {
                Some(ChannelCommand::Reconnect) => return true,
                Some(ChannelCommand::Send(msg)) => {
                    tracing::debug!(kind = msg.kind(), "dropping message, not connected");
                }
                Some(ChannelCommand::Shutdown) | None => return false,
            }
        }
    }

    async fn drive(&mut self, conn: &K::Connection) -> Ended {
        let conn_id = conn.id();
        let mut seq = Sequencer::new();
        let mut violations = 0u32;
        let mut last_ack = Instant::now();
        let window = self.config.liveness_window();

        let interval = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(ChannelCommand::Send(msg)) => {
                        if !self.transmit(conn, &mut seq, msg).await {
                            return Ended::Dropped;
                        }
                    }
                    Some(ChannelCommand::Reconnect) => return Ended::Reconnect,
                    Some(ChannelCommand::Shutdown) | None => return Ended::Shutdown,
                },

                inbound = conn.recv() => {
                    let data = match inbound {
                        Ok(Some(data)) => data,
                        Ok(None) => return Ended::Dropped,
                        Err(e) => {
                            tracing::debug!(%conn_id, error = %e, "recv error");
                            return Ended::Dropped;
                        }
                    };

                    let envelope: Envelope<ServerMessage> =
                        match self.codec.decode(&data) {
                            Ok(env) => env,
                            Err(e) => {
                                violations += 1;
                                tracing::warn!(
                                    %conn_id, error = %e, violations,
                                    "dropping undecodable frame"
                                );
                                if violations >= self.config.max_protocol_violations {
                                    return Ended::Violations;
                                }
                                continue;
                            }
                        };
                    violations = 0;

                    match envelope.message {
                        ServerMessage::HeartbeatAck {} => {
                            last_ack = Instant::now();
                            self.status.send_modify(|s| {
                                s.last_heartbeat_ack = Some(last_ack);
                            });
                        }
                        other => {
                            tracing::debug!(%conn_id, kind = other.kind(), "received");
                            self.emit(ChannelEvent::Message(other));
                        }
                    }
                }

                _ = ticker.tick() => {
                    if last_ack.elapsed() >= window {
                        return Ended::LivenessLost;
                    }
                    if !self.transmit(conn, &mut seq, ClientMessage::Heartbeat {}).await {
                        return Ended::Dropped;
                    }
                }
            }
        }
    }

    /// Encodes and sends one message. `false` means the connection is gone.
    async fn transmit(
        &self,
        conn: &K::Connection,
        seq: &mut Sequencer,
        message: ClientMessage,
    ) -> bool {
        let kind = message.kind();
        let bytes = match self.codec.encode(&seq.wrap(message)) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(kind, error = %e, "failed to encode message");
                return true;
            }
        };
        match conn.send(&bytes).await {
            Ok(()) => {
                tracing::trace!(kind, "sent");
                true
            }
            Err(e) => {
                tracing::debug!(kind, error = %e, "send failed");
                false
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|s| {
            s.state = state;
            if state != ConnectionState::Connected {
                s.last_heartbeat_ack = None;
            }
        });
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }
}

/// Awaits `fut` while answering commands that arrive meanwhile.
///
/// Returns `None` if shutdown was requested. Sends are dropped since there
/// is no connection; reconnect requests are redundant while dialing.
async fn serve_commands<F: Future>(
    commands: &mut mpsc::UnboundedReceiver<ChannelCommand>,
    fut: F,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Some(out),
            cmd = commands.recv() => match cmd {
                Some(ChannelCommand::Send(msg)) => {
                    tracing::debug!(kind = msg.kind(), "dropping message, not connected");
                }
                Some(ChannelCommand::Reconnect) => {}
                Some(ChannelCommand::Shutdown) | None => return None,
            },
        }
    }
}
