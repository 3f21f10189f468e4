//! `ArbitrationAuthority` builder and server loop.
//!
//! This is the entry point for running a Pinlock authority. It ties
//! together the layers: transport → protocol → session table, plus the
//! heartbeat-timeout sweeper.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pinlock_protocol::{Codec, ForceLogoutReason, JsonCodec, ServerMessage};
use pinlock_session::{PinVerifier, SessionConfig, SessionTable};
use pinlock_transport::{Transport, WebSocketTransport};
use tokio::task::JoinHandle;

use crate::PinlockError;
use crate::handler::handle_connection;
use crate::routes::Routes;

/// Shared authority state passed to each connection handler task.
pub(crate) struct AuthorityState<V: PinVerifier, C: Codec> {
    pub(crate) sessions: SessionTable,
    pub(crate) routes: Routes,
    pub(crate) verifier: V,
    pub(crate) codec: C,
}

impl<V: PinVerifier, C: Codec> AuthorityState<V, C> {
    /// Connections that send nothing for this long are closed.
    pub(crate) fn idle_timeout(&self) -> Duration {
        self.sessions.config().heartbeat_timeout
    }
}

/// Builder for configuring and starting an authority.
///
/// # Example
///
/// ```rust,no_run
/// use pinlock::prelude::*;
///
/// # async fn run() -> Result<(), PinlockError> {
/// let authority = AuthorityBuilder::new()
///     .bind("0.0.0.0:8080")
///     .build(AllowList::new(["1234", "5678"])?)
///     .await?;
/// authority.run().await
/// # }
/// ```
pub struct AuthorityBuilder {
    bind_addr: String,
    session_config: SessionConfig,
    sweep_interval: Duration,
}

impl AuthorityBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            session_config: SessionConfig::default(),
            sweep_interval: Duration::from_secs(5),
        }
    }

    /// Sets the address to bind the authority to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Sets the session table configuration.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// How often stale sessions are swept. Default: 5 seconds.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Binds the listener with the given PIN verifier.
    ///
    /// Uses `JsonCodec` and `WebSocketTransport`.
    pub async fn build<V: PinVerifier>(
        self,
        verifier: V,
    ) -> Result<ArbitrationAuthority<V, JsonCodec>, PinlockError> {
        let transport = WebSocketTransport::bind(&self.bind_addr).await?;

        let state = Arc::new(AuthorityState {
            sessions: SessionTable::new(self.session_config),
            routes: Routes::default(),
            verifier,
            codec: JsonCodec,
        });

        Ok(ArbitrationAuthority {
            transport,
            state,
            sweep_interval: self.sweep_interval,
        })
    }
}

impl Default for AuthorityBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The single source of truth for which device holds each PIN.
///
/// Created by [`AuthorityBuilder`]. Call [`run()`](Self::run) to start
/// accepting connections.
pub struct ArbitrationAuthority<V: PinVerifier, C: Codec> {
    transport: WebSocketTransport,
    state: Arc<AuthorityState<V, C>>,
    sweep_interval: Duration,
}

impl<V, C> ArbitrationAuthority<V, C>
where
    V: PinVerifier,
    C: Codec,
{
    /// Returns the local address the authority is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// Runs the accept loop until the process is terminated.
    pub async fn run(self) -> Result<(), PinlockError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the accept loop until `shutdown` completes.
    ///
    /// Connection tasks already running are left to finish on their own;
    /// the sweeper stops with the loop.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<(), PinlockError>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            addr = ?self.transport.local_addr().ok(),
            "arbitration authority running"
        );

        let _sweeper = SweeperGuard(tokio::spawn(sweep(
            Arc::clone(&self.state),
            self.sweep_interval,
        )));

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("arbitration authority shutting down");
                    return Ok(());
                }
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(conn, state).await {
                                tracing::debug!(
                                    error = %e,
                                    "connection ended with error"
                                );
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
            }
        }
    }
}

/// Aborts the sweeper when the accept loop exits, on every path.
struct SweeperGuard(JoinHandle<()>);

impl Drop for SweeperGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Clears sessions whose holder stopped heartbeating.
async fn sweep<V: PinVerifier, C: Codec>(
    state: Arc<AuthorityState<V, C>>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let expired = state
            .sessions
            .expire_stale(|session| {
                let holder = &session.holder;
                let notified = state.routes.deliver(
                    holder.connection,
                    ServerMessage::ForceLogout {
                        reason: ForceLogoutReason::SessionExpired,
                        new_device_details: None,
                    },
                );
                tracing::info!(
                    device_id = %holder.device_id.short(),
                    conn_id = %holder.connection,
                    notified,
                    "session expired"
                );
            })
            .await;
        if expired > 0 {
            tracing::debug!(expired, "sweep finished");
        }
    }
}
