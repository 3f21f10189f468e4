//! The device-side runtime: a [`SessionChannel`] driven by a
//! [`SessionStateMachine`].

use std::time::Duration;

use pinlock_protocol::{
    ClientMessage, Codec, Envelope, JsonCodec, Pin, Sequencer, ServerMessage,
};
use pinlock_transport::{Connection, Connector};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::{
    ChannelConfig, ChannelEvent, ChannelStatus, ClientError, ClientSessionState,
    DeviceIdentity, Notice, SessionChannel, SessionStateMachine, Transition,
};

type Reply = oneshot::Sender<Result<(), ClientError>>;

enum Intent {
    Submit { raw: String, reply: Reply },
    Logout { reply: Reply },
}

/// A device's session with the authority.
///
/// Owns a background task that feeds channel events and user intents
/// through the state machine, one at a time. Dropping the client ends
/// that task, which closes the connection.
pub struct SessionClient {
    intents: mpsc::UnboundedSender<Intent>,
    state: watch::Receiver<ClientSessionState>,
    channel: watch::Receiver<ChannelStatus>,
    reconnect: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl SessionClient {
    /// Connects through `connector` and starts the session runtime.
    ///
    /// Returns the client and the stream of user-facing notices.
    pub fn start<K: Connector>(
        connector: K,
        identity: DeviceIdentity,
        config: ChannelConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (channel, events) = SessionChannel::spawn(connector, config);
        let machine = SessionStateMachine::new(identity.device_id.clone(), identity.label());

        let (intent_tx, intent_rx) = mpsc::unbounded_channel();
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(machine.state());
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let channel_status = channel.watch_status();

        let runtime = Runtime {
            machine,
            channel,
            state: state_tx,
            notices: notice_tx,
        };
        let task = tokio::spawn(runtime.run(events, intent_rx, reconnect_rx));

        (
            Self {
                intents: intent_tx,
                state: state_rx,
                channel: channel_status,
                reconnect: reconnect_tx,
                task,
            },
            notice_rx,
        )
    }

    /// Submits a PIN for registration.
    ///
    /// `Ok(())` means the registration was sent; the outcome arrives as a
    /// [`Notice`].
    pub async fn submit_pin(&self, raw: &str) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.intents
            .send(Intent::Submit {
                raw: raw.to_string(),
                reply,
            })
            .map_err(|_| ClientError::ChannelClosed)?;
        rx.await.map_err(|_| ClientError::ChannelClosed)?
    }

    /// Logs out of the active session.
    pub async fn logout(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.intents
            .send(Intent::Logout { reply })
            .map_err(|_| ClientError::ChannelClosed)?;
        rx.await.map_err(|_| ClientError::ChannelClosed)?
    }

    /// Starts a fresh connect cycle, e.g. after
    /// [`Notice::ConnectivityExhausted`].
    pub fn retry(&self) -> Result<(), ClientError> {
        self.reconnect
            .send(())
            .map_err(|_| ClientError::ChannelClosed)
    }

    pub fn state(&self) -> ClientSessionState {
        *self.state.borrow()
    }

    /// A receiver that observes every session state change.
    pub fn watch_state(&self) -> watch::Receiver<ClientSessionState> {
        self.state.clone()
    }

    pub fn connection_state(&self) -> ChannelStatus {
        *self.channel.borrow()
    }

    /// A receiver that observes every link status change.
    pub fn watch_connection(&self) -> watch::Receiver<ChannelStatus> {
        self.channel.clone()
    }

    /// Stops the runtime and waits for the connection to close.
    pub async fn shutdown(self) {
        // Closing the intent queue ends the runtime loop, which closes
        // the channel on its way out.
        let Self { intents, task, .. } = self;
        drop(intents);
        let _ = task.await;
    }
}

struct Runtime {
    machine: SessionStateMachine,
    channel: SessionChannel,
    state: watch::Sender<ClientSessionState>,
    notices: mpsc::UnboundedSender<Notice>,
}

impl Runtime {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut intents: mpsc::UnboundedReceiver<Intent>,
        mut reconnect: mpsc::UnboundedReceiver<()>,
    ) {
        loop {
            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(Intent::Submit { raw, reply }) => {
                        let result = self.machine.submit_pin(&raw);
                        let _ = reply.send(self.apply_intent(result));
                    }
                    Some(Intent::Logout { reply }) => {
                        let result = self.machine.logout();
                        let _ = reply.send(self.apply_intent(result));
                    }
                    None => break,
                },

                Some(()) = reconnect.recv() => {
                    if let Err(e) = self.channel.reconnect() {
                        tracing::debug!(error = %e, "retry requested after channel stopped");
                    }
                }

                event = events.recv() => match event {
                    Some(event) => {
                        let transition = self.machine.on_channel_event(event);
                        self.apply(transition);
                    }
                    None => break,
                },
            }
        }
        self.channel.close().await;
    }

    fn apply_intent(
        &mut self,
        result: Result<Transition, ClientError>,
    ) -> Result<(), ClientError> {
        let transition = result?;
        self.apply(transition);
        Ok(())
    }

    fn apply(&mut self, transition: Transition) {
        let Transition {
            outbound,
            notice,
            reconnect,
            via,
        } = transition;

        if let Some(via) = via {
            self.state.send_replace(via);
        }
        if let Some(msg) = outbound {
            if let Err(e) = self.channel.send(msg) {
                tracing::warn!(error = %e, "could not queue message");
            }
        }
        if reconnect {
            if let Err(e) = self.channel.reconnect() {
                tracing::warn!(error = %e, "could not request reconnect");
            }
        }
        self.state.send_replace(self.machine.state());
        if let Some(notice) = notice {
            tracing::debug!(%notice, "notice");
            let _ = self.notices.send(notice);
        }
    }
}

// ---------------------------------------------------------------------------
// One-shot verification
// ---------------------------------------------------------------------------

/// Asks the authority whether `pin` is acceptable, without registering.
///
/// Opens its own short-lived connection, so it works whether or not a
/// [`SessionClient`] is running.
///
/// # Errors
/// - `Authentication` if the authority says the PIN is invalid
/// - `Connectivity` if no answer arrives within `timeout`
/// - `Transport` / `Protocol` for link or framing failures
pub async fn verify_pin<K: Connector>(
    connector: &K,
    pin: &Pin,
    timeout: Duration,
) -> Result<(), ClientError> {
    match tokio::time::timeout(timeout, verify_once(connector, pin)).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Connectivity("no answer to verify-pin")),
    }
}

async fn verify_once<K: Connector>(
    connector: &K,
    pin: &Pin,
) -> Result<(), ClientError> {
    let codec = JsonCodec;
    let conn = connector.connect().await?;
    let mut seq = Sequencer::new();
    let request = seq.wrap(ClientMessage::VerifyPin { pin: pin.clone() });
    conn.send(&codec.encode(&request)?).await?;

    let result = loop {
        let Some(data) = conn.recv().await? else {
            break Err(ClientError::Connectivity("closed before verify-pin answer"));
        };
        let envelope: Envelope<ServerMessage> = codec.decode(&data)?;
        match envelope.message {
            ServerMessage::PinVerification { valid: true, .. } => break Ok(()),
            ServerMessage::PinVerification {
                valid: false,
                message,
            } => {
                break Err(ClientError::Authentication(
                    message.unwrap_or_else(|| "Invalid PIN".into()),
                ));
            }
            other => {
                tracing::debug!(kind = other.kind(), "ignoring while verifying");
            }
        }
    };

    let _ = conn.close().await;
    result
}
