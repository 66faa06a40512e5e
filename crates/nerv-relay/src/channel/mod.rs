//! Channel state machine and handshake.
//!
//! ```text
//! DISCONNECTED --connect()--> CONNECTING --physical connect--> HANDSHAKING
//! HANDSHAKING --ACK/HANDSHAKE--> READY (outbox flushed)
//! READY --disconnect()--> DRAINING --> DISCONNECTED
//! any --physical drop / handshake failure / protocol mismatch--> DISCONNECTED
//! ```
//!
//! State, epoch and the outbox flush decision live under one lock, so a send
//! can never slip into the outbox after the READY flush. Each transition into
//! or out of a session bumps the epoch; timers and late events carrying an
//! older epoch are ignored, which keeps a handshake cancelled mid-flight from
//! ever resolving into READY.
//!
//! Telemetry and health updates produced under the lock are collected in
//! [`Effects`] and applied after it is released.

pub mod state;

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use nerv_core::error::{NervError, ReasonCode, Result};
use nerv_core::protocol::handshake::is_handshake_ack;
use nerv_core::protocol::{self, ActorId, Envelope, HandshakeDescriptor, PROTOCOL_VERSION};

use crate::buffers::Direction;
use crate::context::NervContext;
use crate::obs::{signal, Effects, HealthSignal, ObserverList, Subscription};
use crate::outcome::SendOutcome;
use crate::transport::{DuplexAdapter, Transport, TransportEvent};

pub use state::ChannelState;

struct Core {
    state: ChannelState,
    epoch: u64,
    /// Cleared by `disconnect()` and by forced disconnects; a physical
    /// connect while this is false is ignored.
    want_connected: bool,
    handshake_timer: Option<JoinHandle<()>>,
}

struct Inner {
    ctx: NervContext,
    transport: Transport,
    core: Mutex<Core>,
    state_tx: watch::Sender<ChannelState>,
    receivers: ObserverList<Envelope>,
    peer_actor: ActorId,
    descriptor: HandshakeDescriptor,
    handshake_timeout: Duration,
    events_task: Mutex<Option<JoinHandle<()>>>,
}

pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    /// Spawns the transport event loop, so it fails with
    /// [`NervError::Construction`] outside a tokio runtime.
    pub fn new(ctx: &NervContext, adapter: Arc<dyn DuplexAdapter>) -> Result<Self> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(NervError::Construction(
                "channel requires a tokio runtime".into(),
            ));
        }
        let cfg = ctx.cfg();
        let peer_actor = ActorId::parse(&cfg.peer.actor)?;
        let descriptor = HandshakeDescriptor::new(
            ctx.local_actor().as_str(),
            cfg.handshake.capabilities.clone(),
        );

        let (transport, events) = Transport::new(ctx, adapter);
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);

        let inner = Arc::new(Inner {
            ctx: ctx.clone(),
            transport,
            core: Mutex::new(Core {
                state: ChannelState::Disconnected,
                epoch: 0,
                want_connected: false,
                handshake_timer: None,
            }),
            state_tx,
            receivers: ObserverList::new(),
            peer_actor,
            descriptor,
            handshake_timeout: Duration::from_millis(cfg.handshake.timeout_ms),
            events_task: Mutex::new(None),
        });

        let task = tokio::spawn(event_loop(Arc::downgrade(&inner), events));
        match inner.events_task.lock() {
            Ok(mut g) => *g = Some(task),
            Err(poisoned) => *poisoned.into_inner() = Some(task),
        }

        Ok(Self { inner })
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state_tx.borrow()
    }

    /// Watch state transitions; the receiver starts at the current state.
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state_tx.subscribe()
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    /// Receivers for READY inbound envelopes.
    pub fn on_receive<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner.receivers.subscribe(handler)
    }

    pub fn receiver_count(&self) -> usize {
        self.inner.receivers.len()
    }

    /// Start a session. A no-op unless DISCONNECTED, so concurrent calls
    /// perform at most one handshake.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let mut fx = Effects::default();
        let epoch = {
            let mut core = inner.core();
            if core.state != ChannelState::Disconnected {
                tracing::debug!(state = %core.state, "connect ignored");
                return Ok(());
            }
            core.want_connected = true;
            core.epoch += 1;
            inner.set_state(&mut core, ChannelState::Connecting, &mut fx);
            core.epoch
        };
        inner.apply(fx);

        match inner.transport.start().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut fx = Effects::default();
                {
                    let mut core = inner.core();
                    if core.epoch == epoch && core.state == ChannelState::Connecting {
                        // A running backoff loop keeps the session wanted.
                        core.want_connected = inner.transport.is_reconnecting();
                        inner.set_state(&mut core, ChannelState::Disconnected, &mut fx);
                    }
                }
                inner.apply(fx);
                Err(e)
            }
        }
    }

    /// End the session. From READY the channel drains (best-effort outbox
    /// flush, new sends refused) before stopping the transport. Idempotent;
    /// cancels pending reconnection and handshake timers.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let mut fx = Effects::default();
        {
            let mut core = inner.core();
            core.want_connected = false;
            core.epoch += 1;
            if let Some(t) = core.handshake_timer.take() {
                t.abort();
            }
            match core.state {
                ChannelState::Ready => {
                    inner.set_state(&mut core, ChannelState::Draining, &mut fx);
                    inner.flush_outbox(&mut fx);
                }
                ChannelState::Disconnected | ChannelState::Draining => {}
                _ => inner.set_state(&mut core, ChannelState::Disconnected, &mut fx),
            }
        }
        inner.apply(fx);

        inner.transport.stop().await;

        let mut fx = Effects::default();
        {
            let mut core = inner.core();
            if core.state == ChannelState::Draining {
                inner.set_state(&mut core, ChannelState::Disconnected, &mut fx);
            }
        }
        inner.apply(fx);
    }

    /// Transmit when READY, queue otherwise, refuse while DRAINING.
    pub fn send(&self, env: Envelope) -> SendOutcome {
        let inner = &self.inner;
        let mut fx = Effects::default();
        let outcome = {
            let core = inner.core();
            match core.state {
                ChannelState::Draining => {
                    tracing::debug!(msg_id = %env.msg_id(), "send refused while draining");
                    fx.signal(
                        signal::EMISSION_REJECTED,
                        json!({
                            "reason": ReasonCode::ChannelDraining.as_str(),
                            "msg_id": env.msg_id().to_string(),
                        }),
                    );
                    SendOutcome::Dropped(ReasonCode::ChannelDraining)
                }
                // Anything already waiting goes first.
                ChannelState::Ready if inner.ctx.buffers().is_empty(Direction::Outbound) => {
                    inner.transmit_or_queue(env, &mut fx)
                }
                _ => inner.queue(env, &mut fx),
            }
        };
        inner.apply(fx);
        outcome
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let task = match self.events_task.get_mut() {
            Ok(t) => t.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(t) = task {
            t.abort();
        }
        let core = match self.core.get_mut() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(t) = core.handshake_timer.take() {
            t.abort();
        }
    }
}

async fn event_loop(weak: Weak<Inner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(ev) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.on_transport_event(ev).await;
    }
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        match self.core.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn apply(&self, fx: Effects) {
        if !fx.is_empty() {
            fx.apply(&self.ctx.telemetry(), &self.ctx.health());
        }
    }

    fn set_state(&self, core: &mut Core, next: ChannelState, fx: &mut Effects) {
        let prev = core.state;
        if prev == next {
            return;
        }
        core.state = next;
        self.state_tx.send_replace(next);
        tracing::info!(from = %prev, to = %next, epoch = core.epoch, "channel state");
        fx.signal(
            signal::CHANNEL_STATE,
            json!({ "from": prev.as_str(), "to": next.as_str() }),
        );
    }

    /// Back to DISCONNECTED without wanting a new session. The caller stops
    /// the transport once the lock is released.
    fn force_disconnect(&self, core: &mut Core, fx: &mut Effects) {
        core.want_connected = false;
        core.epoch += 1;
        if let Some(t) = core.handshake_timer.take() {
            t.abort();
        }
        self.set_state(core, ChannelState::Disconnected, fx);
    }

    fn queue(&self, env: Envelope, fx: &mut Effects) -> SendOutcome {
        let msg_id = env.msg_id().to_string();
        if self.ctx.buffers().enqueue_with(Direction::Outbound, env, fx) {
            fx.signal(signal::EMISSION_QUEUED, json!({ "msg_id": msg_id }));
            SendOutcome::Queued
        } else {
            fx.signal(
                signal::EMISSION_ENQUEUE_FAILED,
                json!({ "reason": ReasonCode::BufferFull.as_str(), "msg_id": msg_id }),
            );
            SendOutcome::Rejected(ReasonCode::BufferFull)
        }
    }

    fn transmit_or_queue(&self, env: Envelope, fx: &mut Effects) -> SendOutcome {
        let bytes = match protocol::encode(&env) {
            Ok(b) => b,
            Err(e) => {
                fx.signal(
                    signal::EMISSION_REJECTED,
                    json!({ "reason": e.reason_code().as_str(), "error": e.to_string() }),
                );
                return SendOutcome::Rejected(e.reason_code());
            }
        };
        if self.transport.send_with(&bytes, fx) {
            fx.signal(
                signal::EMISSION_SENT,
                json!({ "msg_id": env.msg_id().to_string(), "action": env.action().as_str() }),
            );
            SendOutcome::Sent
        } else {
            self.queue(env, fx)
        }
    }

    /// Drain the outbox into the transport. Stops at the first failed send
    /// and puts that envelope back at the head.
    fn flush_outbox(&self, fx: &mut Effects) {
        let buffers = self.ctx.buffers();
        let mut flushed = 0usize;
        while let Some(env) = buffers.dequeue_with(Direction::Outbound, fx) {
            let bytes = match protocol::encode(&env) {
                Ok(b) => b,
                Err(e) => {
                    fx.signal(
                        signal::EMISSION_REJECTED,
                        json!({ "reason": e.reason_code().as_str(), "error": e.to_string() }),
                    );
                    continue;
                }
            };
            if !self.transport.send_with(&bytes, fx) {
                buffers.requeue_front_with(Direction::Outbound, env, fx);
                break;
            }
            fx.signal(
                signal::EMISSION_SENT,
                json!({ "msg_id": env.msg_id().to_string(), "action": env.action().as_str() }),
            );
            flushed += 1;
        }
        let remaining = buffers.size(Direction::Outbound);
        if flushed > 0 || remaining > 0 {
            tracing::debug!(flushed, remaining, "outbox flushed");
        }
        fx.signal(
            signal::OUTBOX_FLUSHED,
            json!({ "flushed": flushed, "remaining": remaining }),
        );
    }

    async fn on_transport_event(self: &Arc<Self>, ev: TransportEvent) {
        let stop = match ev {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Frame(bytes) => self.on_frame(&bytes),
            TransportEvent::Disconnected { reason } => {
                self.on_dropped(&reason, false);
                false
            }
            TransportEvent::GaveUp => {
                self.on_dropped("reconnection exhausted", true);
                false
            }
            TransportEvent::Error(message) => {
                tracing::debug!(error = %message, "transport error");
                false
            }
        };
        if stop {
            self.transport.stop().await;
        }
    }

    /// Physical link up: send the handshake (bypassing the outbox) and arm
    /// the timeout. Returns true when the transport must be stopped.
    fn on_connected(self: &Arc<Self>) -> bool {
        let mut fx = Effects::default();
        let stop = {
            let mut core = self.core();
            let expected = matches!(
                core.state,
                ChannelState::Connecting | ChannelState::Disconnected
            );
            if !core.want_connected || !expected {
                tracing::debug!(state = %core.state, "physical connect ignored");
                return false;
            }

            core.epoch += 1;
            let epoch = core.epoch;
            self.set_state(&mut core, ChannelState::Handshaking, &mut fx);

            let hello = Envelope::handshake(self.ctx.local_actor(), &self.peer_actor, &self.descriptor)
                .and_then(|env| protocol::encode(&env).map(|b| (env, b)));
            match hello {
                Ok((env, bytes)) if self.transport.send_with(&bytes, &mut fx) => {
                    fx.signal(
                        signal::HANDSHAKE_SENT,
                        json!({
                            "msg_id": env.msg_id().to_string(),
                            "agent_id": self.descriptor.agent_id,
                        }),
                    );
                    core.handshake_timer = Some(self.arm_handshake_timeout(epoch));
                    false
                }
                other => {
                    let detail = match other {
                        Err(e) => e.to_string(),
                        Ok(_) => "handshake send failed".to_owned(),
                    };
                    tracing::warn!(%detail, "handshake could not be sent");
                    fx.signal(
                        signal::HANDSHAKE_FAILED,
                        json!({ "reason": ReasonCode::Transport.as_str(), "detail": detail }),
                    );
                    self.force_disconnect(&mut core, &mut fx);
                    true
                }
            }
        };
        self.apply(fx);
        stop
    }

    fn arm_handshake_timeout(self: &Arc<Self>, epoch: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let wait = self.handshake_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_handshake_timeout(epoch).await;
            }
        })
    }

    async fn on_handshake_timeout(&self, epoch: u64) {
        let mut fx = Effects::default();
        let stop = {
            let mut core = self.core();
            if core.epoch != epoch || core.state != ChannelState::Handshaking {
                false
            } else {
                // This task is the timer; detach instead of aborting itself.
                core.handshake_timer.take();
                tracing::warn!(timeout_ms = self.handshake_timeout.as_millis() as u64, "handshake timed out");
                fx.signal(
                    signal::HANDSHAKE_FAILED,
                    json!({
                        "reason": ReasonCode::HandshakeTimeout.as_str(),
                        "timeout_ms": self.handshake_timeout.as_millis() as u64,
                    }),
                );
                self.force_disconnect(&mut core, &mut fx);
                true
            }
        };
        self.apply(fx);
        if stop {
            self.transport.stop().await;
        }
    }

    /// Returns true when the transport must be stopped.
    fn on_frame(&self, bytes: &[u8]) -> bool {
        let env = match protocol::decode(bytes, self.ctx.now_ms()) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, "inbound frame rejected");
                self.ctx.telemetry().emit(
                    signal::RECEPTION_DROPPED,
                    json!({ "reason": e.reason_code().as_str(), "error": e.to_string() }),
                );
                return false;
            }
        };

        let mut fx = Effects::default();
        let (deliver, stop) = {
            let mut core = self.core();
            let version = env.protocol().version;
            match core.state {
                ChannelState::Handshaking | ChannelState::Ready if version != PROTOCOL_VERSION => {
                    tracing::warn!(expected = PROTOCOL_VERSION, got = version, "protocol mismatch");
                    fx.signal(
                        signal::PROTOCOL_MISMATCH,
                        json!({
                            "expected": PROTOCOL_VERSION,
                            "got": version,
                            "msg_id": env.msg_id().to_string(),
                        }),
                    );
                    fx.signal(signal::RECEPTION_DROPPED, dropped_meta(&env, ReasonCode::ProtocolMismatch, core.state));
                    self.force_disconnect(&mut core, &mut fx);
                    (false, true)
                }
                ChannelState::Handshaking if is_handshake_ack(&env) => {
                    if let Some(t) = core.handshake_timer.take() {
                        t.abort();
                    }
                    self.set_state(&mut core, ChannelState::Ready, &mut fx);
                    fx.signal(
                        signal::HANDSHAKE_COMPLETED,
                        json!({
                            "peer": env.source().as_str(),
                            "correlation_id": env.correlation_id().to_string(),
                        }),
                    );
                    self.flush_outbox(&mut fx);
                    (false, false)
                }
                ChannelState::Handshaking => {
                    tracing::warn!(kind = %env.kind(), action = %env.action(), "handshake rejected");
                    fx.signal(
                        signal::HANDSHAKE_FAILED,
                        json!({
                            "reason": ReasonCode::HandshakeRejected.as_str(),
                            "kind": env.kind().as_str(),
                            "action": env.action().as_str(),
                        }),
                    );
                    fx.signal(signal::RECEPTION_DROPPED, dropped_meta(&env, ReasonCode::ChannelNotReady, core.state));
                    self.force_disconnect(&mut core, &mut fx);
                    (false, true)
                }
                ChannelState::Ready => (true, false),
                state => {
                    tracing::debug!(%state, msg_id = %env.msg_id(), "inbound dropped: channel not ready");
                    fx.signal(signal::RECEPTION_DROPPED, dropped_meta(&env, ReasonCode::ChannelNotReady, state));
                    (false, false)
                }
            }
        };
        self.apply(fx);

        if deliver {
            self.deliver(env);
        }
        stop
    }

    /// READY inbound: correlation record, inbox, then receivers.
    fn deliver(&self, env: Envelope) {
        let telemetry = self.ctx.telemetry();
        self.ctx.correlation().append(env.correlation_id(), &env);
        // A full inbox is signalled as pressure; push delivery still happens.
        self.ctx.buffers().enqueue(Direction::Inbound, env.clone());
        self.ctx.health().report(HealthSignal::Reception);

        let failures = self.receivers.notify(&env);
        telemetry.emit(
            signal::RECEPTION_DELIVERED,
            json!({
                "msg_id": env.msg_id().to_string(),
                "correlation_id": env.correlation_id().to_string(),
                "kind": env.kind().as_str(),
                "action": env.action().as_str(),
            }),
        );
        if failures > 0 {
            telemetry.emit(
                signal::RECEPTION_HANDLER_ERROR,
                json!({ "failures": failures, "msg_id": env.msg_id().to_string() }),
            );
        }
    }

    /// Physical drop or reconnection given up.
    fn on_dropped(&self, reason: &str, final_drop: bool) {
        let mut fx = Effects::default();
        {
            let mut core = self.core();
            if let Some(t) = core.handshake_timer.take() {
                t.abort();
            }
            if final_drop {
                core.want_connected = false;
            }
            if core.state != ChannelState::Disconnected {
                core.epoch += 1;
                tracing::info!(%reason, "channel lost its link");
                self.set_state(&mut core, ChannelState::Disconnected, &mut fx);
            }
        }
        self.apply(fx);
    }
}

fn dropped_meta(env: &Envelope, reason: ReasonCode, state: ChannelState) -> serde_json::Value {
    json!({
        "reason": reason.as_str(),
        "state": state.as_str(),
        "msg_id": env.msg_id().to_string(),
        "kind": env.kind().as_str(),
        "action": env.action().as_str(),
    })
}
