//! In-memory connections for unit tests.
//!
//! A [`PipeConnector`] hands out [`PipeConnection`]s whose other end is a
//! [`PipePeer`] the test drives by hand. No sockets, so tests can run with
//! paused time.

use std::sync::atomic::{AtomicU64, Ordering};

use pinlock_protocol::{ClientMessage, Envelope, ServerMessage};
use pinlock_transport::{Connection, ConnectionId, Connector, TransportError};
use tokio::sync::{Mutex, mpsc};

pub(crate) struct PipeConnector {
    peers: mpsc::UnboundedSender<PipePeer>,
    next_id: AtomicU64,
}

impl PipeConnector {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<PipePeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers: tx,
                next_id: AtomicU64::new(1),
            },
            rx,
        )
    }
}

impl Connector for PipeConnector {
    type Connection = PipeConnection;

    async fn connect(&self) -> Result<PipeConnection, TransportError> {
        let (to_peer, from_device) = mpsc::unbounded_channel();
        let (to_device, from_peer) = mpsc::unbounded_channel();
        let peer = PipePeer {
            inbound: from_device,
            outbound: to_device,
        };
        self.peers.send(peer).map_err(|_| {
            TransportError::ConnectFailed(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "no peer listening",
            ))
        })?;
        Ok(PipeConnection {
            id: ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed)),
            outbound: to_peer,
            inbound: Mutex::new(from_peer),
        })
    }
}

pub(crate) struct PipeConnection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl Connection for PipeConnection {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        self.outbound.send(data.to_vec()).map_err(|_| {
            TransportError::SendFailed(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer gone",
            ))
        })
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.inbound.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inbound.lock().await.close();
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}

/// The authority's end of a pipe.
pub(crate) struct PipePeer {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl PipePeer {
    /// Next envelope the device sent, or `None` once the device hung up.
    pub(crate) async fn recv_client(&mut self) -> Option<Envelope<ClientMessage>> {
        let data = self.inbound.recv().await?;
        Some(serde_json::from_slice(&data).expect("device sent valid json"))
    }

    /// Like [`recv_client`](Self::recv_client) but never waits.
    pub(crate) fn try_recv_client(&mut self) -> Option<Envelope<ClientMessage>> {
        let data = self.inbound.try_recv().ok()?;
        Some(serde_json::from_slice(&data).expect("device sent valid json"))
    }

    pub(crate) fn send_server(&self, message: ServerMessage) {
        let env = Envelope {
            seq: 0,
            timestamp: 0,
            message,
        };
        self.send_raw(serde_json::to_vec(&env).expect("encode"));
    }

    pub(crate) fn send_raw(&self, data: Vec<u8>) {
        let _ = self.outbound.send(data);
    }
}
