//! Peer endpoint: the accepting side of the handshake.
//!
//! Each TCP session must open with `COMMAND/HANDSHAKE`; it is answered with
//! `ACK/HANDSHAKE` and the session is registered. Traffic before that is
//! dropped as `CHANNEL_NOT_READY`. Envelopes received afterwards are
//! injected into a local [`Router`] so in-process observers see them.

pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use nerv_core::error::{NervError, Result};
use nerv_core::protocol::{ActorId, Envelope};

use crate::context::NervContext;
use crate::router::Router;

pub use session::{Connection, SessionRegistry};

pub(crate) struct Shared {
    pub(crate) ctx: NervContext,
    pub(crate) actor: ActorId,
    pub(crate) router: Router,
    pub(crate) sessions: SessionRegistry,
}

#[derive(Clone)]
pub struct PeerServer {
    shared: Arc<Shared>,
}

impl PeerServer {
    pub fn new(ctx: NervContext) -> Result<Self> {
        let actor = session::server_actor(&ctx.cfg().peer.actor)?;
        let router = Router::local(ctx.telemetry());
        router.start();
        Ok(Self {
            shared: Arc::new(Shared {
                ctx,
                actor,
                router,
                sessions: SessionRegistry::new(),
            }),
        })
    }

    pub async fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| NervError::Transport(format!("bind {addr} failed: {e}")))
    }

    /// Accept sessions until the listener fails. Each session runs on its
    /// own task.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if let Ok(local) = listener.local_addr() {
            tracing::info!(%local, actor = %self.shared.actor, "peer endpoint listening");
        }
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| NervError::Transport(format!("accept failed: {e}")))?;
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                if let Err(e) = session::run_session(shared, stream, addr).await {
                    tracing::debug!(%addr, error = %e, "peer session ended with error");
                }
            });
        }
    }

    /// Bind `addr` and serve in the background. Returns the bound address.
    pub async fn spawn(&self, addr: &str) -> Result<(SocketAddr, tokio::task::JoinHandle<Result<()>>)> {
        let listener = Self::bind(addr).await?;
        let local = listener
            .local_addr()
            .map_err(|e| NervError::Transport(format!("local_addr: {e}")))?;
        let this = self.clone();
        let task = tokio::spawn(async move { this.serve(listener).await });
        Ok((local, task))
    }

    /// Observers of post-handshake traffic.
    pub fn router(&self) -> &Router {
        &self.shared.router
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.shared.sessions
    }

    pub fn context(&self) -> &NervContext {
        &self.shared.ctx
    }

    /// Push an envelope to every handshaken session.
    pub fn broadcast(&self, env: &Envelope) -> usize {
        self.shared.sessions.broadcast(env)
    }
}
