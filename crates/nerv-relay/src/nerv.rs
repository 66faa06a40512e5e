//! Public facade.
//!
//! `Nerv` composes the context, the router and (in hybrid mode) the channel.
//! It never drains buffers or decides anything on its own: inbound envelopes
//! are pushed to subscribers and parked in the inbox for whoever pulls them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;

use nerv_core::error::{ReasonCode, Result};
use nerv_core::protocol::{self, ActorId, Envelope, RawEnvelope};

use crate::buffers::{Buffers, Direction};
use crate::channel::{Channel, ChannelState};
use crate::config::{Mode, RelayConfig};
use crate::context::NervContext;
use crate::correlation::CorrelationStore;
use crate::obs::{signal, HealthMonitor, HealthSignal, HealthSnapshot, Subscription, TelemetryBus};
use crate::outcome::SendOutcome;
use crate::router::{Router, RouterStatus};
use crate::transport::{DuplexAdapter, TcpAdapter};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NervStatus {
    pub mode: &'static str,
    pub router: RouterStatus,
    pub health: HealthSnapshot,
    pub inbound: usize,
    pub outbound: usize,
    pub correlations: usize,
}

pub struct Nerv {
    ctx: NervContext,
    router: Router,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Nerv {
    /// Build from config. Hybrid mode dials `remote.address` over TCP and
    /// returns `Err` outside a tokio runtime.
    pub fn new(cfg: RelayConfig) -> Result<Self> {
        Self::with_context(NervContext::new(cfg)?, None)
    }

    /// Like [`Nerv::new`] with a caller-supplied adapter for hybrid mode.
    pub fn with_adapter(cfg: RelayConfig, adapter: Arc<dyn DuplexAdapter>) -> Result<Self> {
        Self::with_context(NervContext::new(cfg)?, Some(adapter))
    }

    /// The adapter is ignored in local mode.
    pub fn with_context(ctx: NervContext, adapter: Option<Arc<dyn DuplexAdapter>>) -> Result<Self> {
        let router = match ctx.cfg().mode {
            Mode::Local => Router::local(ctx.telemetry()),
            Mode::Hybrid => {
                let adapter = match adapter {
                    Some(a) => a,
                    None => {
                        let addr = ctx
                            .cfg()
                            .remote
                            .as_ref()
                            .map(|r| r.address.clone())
                            .unwrap_or_default();
                        Arc::new(TcpAdapter::new(addr)) as Arc<dyn DuplexAdapter>
                    }
                };
                let channel = Arc::new(Channel::new(&ctx, adapter)?);
                Router::hybrid(ctx.telemetry(), channel)
            }
        };

        // Outside a runtime the caller sweeps by hand.
        let sweeper = tokio::runtime::Handle::try_current().ok().map(|_| {
            let every = Duration::from_millis(ctx.cfg().correlation.sweep_interval_ms);
            ctx.correlation().spawn_sweeper(every)
        });

        tracing::info!(mode = ctx.cfg().mode.as_str(), actor = %ctx.local_actor(), "nerv ready");
        Ok(Self {
            ctx,
            router,
            sweeper: Mutex::new(sweeper),
        })
    }

    /// Start routing and, in hybrid mode, open the remote session.
    pub async fn connect(&self) -> Result<()> {
        self.router.start();
        match self.router.channel() {
            Some(channel) => channel.connect().await,
            None => Ok(()),
        }
    }

    /// Close the remote session (draining the outbox). Local routing keeps
    /// working.
    pub async fn disconnect(&self) {
        if let Some(channel) = self.router.channel() {
            channel.disconnect().await;
        }
    }

    /// Drain, stop the transport, stop routing and the correlation sweeper.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.router.stop();
        if let Some(h) = self.take_sweeper() {
            h.abort();
        }
        tracing::info!("nerv shut down");
    }

    /// Record the envelope in its causal chain and route it.
    pub fn send(&self, env: Envelope) -> SendOutcome {
        let telemetry = self.ctx.telemetry();
        telemetry.emit(
            signal::EMISSION_ATTEMPT,
            json!({
                "msg_id": env.msg_id().to_string(),
                "correlation_id": env.correlation_id().to_string(),
                "kind": env.kind().as_str(),
                "action": env.action().as_str(),
            }),
        );
        self.ctx.correlation().append(env.correlation_id(), &env);

        let outcome = self.router.send(&env);
        if outcome.is_accepted() {
            self.ctx.health().report(HealthSignal::Emission);
        }
        outcome
    }

    /// Alias of [`Nerv::send`].
    pub fn emit(&self, env: Envelope) -> SendOutcome {
        self.send(env)
    }

    /// Acknowledge `original` on behalf of the local actor.
    pub fn ack(&self, original: &Envelope) -> SendOutcome {
        self.send(Envelope::ack_for_at(
            original,
            self.ctx.local_actor().clone(),
            self.ctx.now_ms(),
        ))
    }

    /// Normalize and validate a caller-supplied raw shape before sending.
    pub fn send_raw(&self, raw: RawEnvelope) -> SendOutcome {
        let raw = protocol::normalize(raw, self.ctx.now_ms());
        match protocol::codec::into_envelope(raw) {
            Ok(env) => self.send(env),
            Err(e) => {
                tracing::warn!(error = %e, "raw envelope rejected");
                self.ctx.telemetry().emit(
                    signal::EMISSION_REJECTED,
                    json!({ "reason": ReasonCode::StructureInvalid.as_str(), "error": e.to_string() }),
                );
                SendOutcome::Rejected(ReasonCode::StructureInvalid)
            }
        }
    }

    pub fn on_receive<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.router.on_receive(handler)
    }

    pub fn on_event<F>(&self, action: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.router.on_event(action, handler)
    }

    pub fn on_actor<F>(&self, actor: ActorId, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.router.on_actor(actor, handler)
    }

    /// Pull up to `max` inbound envelopes in arrival order.
    pub fn drain_inbound(&self, max: usize) -> Vec<Envelope> {
        self.ctx.buffers().drain(Direction::Inbound, max)
    }

    pub fn status(&self) -> NervStatus {
        let buffers = self.ctx.buffers();
        NervStatus {
            mode: self.ctx.cfg().mode.as_str(),
            router: self.router.status(),
            health: self.ctx.health().status(),
            inbound: buffers.size(Direction::Inbound),
            outbound: buffers.size(Direction::Outbound),
            correlations: self.ctx.correlation().len(),
        }
    }

    /// `None` in local mode.
    pub fn channel_state(&self) -> Option<ChannelState> {
        self.router.channel().map(|c| c.state())
    }

    pub fn channel(&self) -> Option<&Arc<Channel>> {
        self.router.channel()
    }

    pub fn context(&self) -> &NervContext {
        &self.ctx
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn telemetry(&self) -> Arc<TelemetryBus> {
        self.ctx.telemetry()
    }

    pub fn health(&self) -> Arc<HealthMonitor> {
        self.ctx.health()
    }

    pub fn buffers(&self) -> Arc<Buffers> {
        self.ctx.buffers()
    }

    pub fn correlation(&self) -> Arc<CorrelationStore> {
        self.ctx.correlation()
    }

    fn take_sweeper(&self) -> Option<JoinHandle<()>> {
        match self.sweeper.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl Drop for Nerv {
    fn drop(&mut self) {
        let sweeper = match self.sweeper.get_mut() {
            Ok(g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(h) = sweeper {
            h.abort();
        }
    }
}
