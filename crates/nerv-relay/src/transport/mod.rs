//! Transport: adapter lifecycle, frame reassembly and reconnection.
//!
//! The adapter reports raw chunks; a pump task runs them through an
//! [`Unpacker`] and forwards whole frames upward as [`TransportEvent`]s.
//! With a [`ReconnectPolicy`], unexpected drops (and failed starts) trigger
//! a backoff loop; `stop()` cancels it.

pub mod adapter;
pub mod memory;
pub mod reconnect;
pub mod tcp;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use nerv_core::error::Result;
use nerv_core::protocol::{pack, Unpacker};

use crate::context::NervContext;
use crate::obs::{signal, Effects, HealthMonitor, HealthSignal, TelemetryBus};

pub use adapter::{AdapterEvent, AdapterEvents, DuplexAdapter};
pub use memory::{memory_pair, MemoryAdapter, MemoryRemote};
pub use reconnect::ReconnectPolicy;
pub use tcp::TcpAdapter;

/// What the transport reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    /// One complete frame payload (header stripped).
    Frame(Bytes),
    Disconnected { reason: String },
    Error(String),
    /// Reconnection attempts exhausted; no further events will follow.
    GaveUp,
}

#[derive(Default)]
struct Control {
    active: bool,
    pump: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct Inner {
    adapter: Arc<dyn DuplexAdapter>,
    policy: Option<ReconnectPolicy>,
    max_frame_bytes: usize,
    telemetry: Arc<TelemetryBus>,
    health: Arc<HealthMonitor>,
    upstream: mpsc::UnboundedSender<TransportEvent>,
    generation: AtomicU64,
    /// Generation of the most recent link that dropped.
    last_drop: AtomicU64,
    ctl: Mutex<Control>,
}

#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(
        ctx: &NervContext,
        adapter: Arc<dyn DuplexAdapter>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (upstream, rx) = mpsc::unbounded_channel();
        let policy = ctx.cfg().reconnect.as_ref().map(ReconnectPolicy::from_config);
        let inner = Arc::new(Inner {
            adapter,
            policy,
            max_frame_bytes: ctx.cfg().framing.max_frame_bytes,
            telemetry: ctx.telemetry(),
            health: ctx.health(),
            upstream,
            generation: AtomicU64::new(0),
            last_drop: AtomicU64::new(0),
            ctl: Mutex::new(Control::default()),
        });
        (Self { inner }, rx)
    }

    pub fn adapter_name(&self) -> &'static str {
        self.inner.adapter.name()
    }

    /// Start the adapter. An explicit start supersedes a running backoff
    /// loop. On failure the error is reported and, with a reconnect policy, a
    /// new backoff loop is scheduled before returning `Err`.
    pub async fn start(&self) -> Result<()> {
        let superseded = {
            let mut ctl = self.inner.ctl();
            ctl.active = true;
            ctl.reconnect.take()
        };
        if let Some(h) = superseded {
            h.abort();
            self.inner
                .telemetry
                .emit(signal::RECONNECT_STOP, json!({ "reason": "restarted" }));
        }
        self.inner
            .telemetry
            .emit(signal::TRANSPORT_STARTING, json!({ "adapter": self.inner.adapter.name() }));

        match self.inner.start_once().await {
            Ok(_) => Ok(()),
            Err(e) => {
                schedule_reconnect(&self.inner);
                Err(e)
            }
        }
    }

    /// Stop the adapter and cancel any pending reconnection. Idempotent.
    pub async fn stop(&self) {
        let (pump, reconnect, was_active) = {
            let mut ctl = self.inner.ctl();
            let was_active = ctl.active;
            ctl.active = false;
            (ctl.pump.take(), ctl.reconnect.take(), was_active)
        };
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(h) = reconnect {
            h.abort();
            self.inner
                .telemetry
                .emit(signal::RECONNECT_STOP, json!({ "reason": "cancelled" }));
            self.inner.health.report(HealthSignal::TransportReconnecting(false));
        }
        if let Some(h) = pump {
            h.abort();
        }
        self.inner.adapter.stop().await;

        if was_active {
            self.inner
                .telemetry
                .emit(signal::TRANSPORT_STOPPING, json!({ "adapter": self.inner.adapter.name() }));
            self.inner.health.report(HealthSignal::TransportDisconnected);
        }
    }

    /// Pack and hand a payload to the adapter. Never blocks; a failed send is
    /// reported through telemetry and returns `false`.
    pub fn send(&self, payload: &[u8]) -> bool {
        let mut fx = Effects::default();
        let ok = self.send_with(payload, &mut fx);
        fx.apply(&self.inner.telemetry, &self.inner.health);
        ok
    }

    /// [`Transport::send`] with telemetry deferred into `fx`.
    pub(crate) fn send_with(&self, payload: &[u8], fx: &mut Effects) -> bool {
        let result = pack(payload).and_then(|frame| self.inner.adapter.send(frame));
        match result {
            Ok(()) => {
                fx.signal(signal::TRANSPORT_SEND, json!({ "bytes": payload.len() }));
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "transport send failed");
                fx.signal(
                    signal::TRANSPORT_SEND_FAILED,
                    json!({ "reason": e.reason_code().as_str(), "error": e.to_string() }),
                );
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.adapter.is_connected()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.ctl().reconnect.is_some()
    }
}

impl Inner {
    fn ctl(&self) -> MutexGuard<'_, Control> {
        match self.ctl.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns the generation of the started link.
    async fn start_once(self: &Arc<Self>) -> Result<u64> {
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();

        let pump = tokio::spawn(pump(Arc::clone(self), gen, rx));
        let old = self.ctl().pump.replace(pump);
        if let Some(old) = old {
            old.abort();
        }

        match self.adapter.start(tx).await {
            Ok(()) => Ok(gen),
            Err(e) => {
                tracing::warn!(adapter = self.adapter.name(), error = %e, "adapter start failed");
                self.report_error(&e.to_string());
                Err(e)
            }
        }
    }

    fn report_error(&self, message: &str) {
        self.telemetry
            .emit(signal::TRANSPORT_ERROR, json!({ "error": message }));
        self.health
            .report(HealthSignal::TransportError(message.to_owned()));
    }

    fn is_current(&self, gen: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == gen
    }
}

async fn pump(inner: Arc<Inner>, gen: u64, mut rx: mpsc::UnboundedReceiver<AdapterEvent>) {
    let mut unpacker = Unpacker::with_max_frame_bytes(inner.max_frame_bytes);

    while let Some(ev) = rx.recv().await {
        if !inner.is_current(gen) {
            break;
        }
        match ev {
            AdapterEvent::Connected => {
                unpacker.reset();
                tracing::info!(adapter = inner.adapter.name(), "transport connected");
                inner
                    .telemetry
                    .emit(signal::TRANSPORT_CONNECTED, json!({ "adapter": inner.adapter.name() }));
                inner.health.report(HealthSignal::TransportConnected);
                let _ = inner.upstream.send(TransportEvent::Connected);
            }
            AdapterEvent::Chunk(chunk) => {
                let upstream = &inner.upstream;
                let telemetry = &inner.telemetry;
                let pushed = unpacker.push(&chunk, |frame| {
                    telemetry.emit(signal::TRANSPORT_RECEIVE, json!({ "bytes": frame.len() }));
                    let _ = upstream.send(TransportEvent::Frame(frame));
                });
                if let Err(e) = pushed {
                    // Stream is unrecoverable once framing is lost.
                    tracing::warn!(error = %e, "framing error; dropping link");
                    inner.report_error(&e.to_string());
                    let _ = inner.upstream.send(TransportEvent::Error(e.to_string()));
                    inner.adapter.stop().await;
                    on_drop(&inner, gen, format!("framing: {e}"));
                    break;
                }
            }
            AdapterEvent::Disconnected { reason } => {
                unpacker.reset();
                on_drop(&inner, gen, reason);
            }
            AdapterEvent::Error(message) => {
                tracing::debug!(error = %message, "adapter error");
                inner.report_error(&message);
                let _ = inner.upstream.send(TransportEvent::Error(message));
            }
        }
    }
}

fn on_drop(inner: &Arc<Inner>, gen: u64, reason: String) {
    // Recorded before `schedule_reconnect` takes the control lock, so a
    // running loop either sees this drop or has already let go of its handle.
    inner.last_drop.store(gen, Ordering::SeqCst);
    tracing::info!(adapter = inner.adapter.name(), %reason, "transport disconnected");
    inner
        .telemetry
        .emit(signal::TRANSPORT_DISCONNECTED, json!({ "reason": reason }));
    inner.health.report(HealthSignal::TransportDisconnected);
    let _ = inner.upstream.send(TransportEvent::Disconnected { reason });
    schedule_reconnect(inner);
}

fn schedule_reconnect(inner: &Arc<Inner>) {
    let Some(policy) = inner.policy.clone() else {
        return;
    };
    let mut ctl = inner.ctl();
    if !ctl.active || ctl.reconnect.is_some() {
        return;
    }
    let task_inner = Arc::clone(inner);
    ctl.reconnect = Some(tokio::spawn(async move {
        reconnect_loop(task_inner, policy).await;
    }));
}

async fn reconnect_loop(inner: Arc<Inner>, policy: ReconnectPolicy) {
    inner.telemetry.emit(
        signal::RECONNECT_START,
        json!({ "attempts": policy.attempts, "delay_ms": policy.delay.as_millis() as u64 }),
    );
    inner.health.report(HealthSignal::TransportReconnecting(true));

    for attempt in 1..=policy.attempts {
        let wait = policy.delay_for(attempt);
        inner.telemetry.emit(
            signal::RECONNECT_ATTEMPT,
            json!({ "attempt": attempt, "delay_ms": wait.as_millis() as u64 }),
        );
        tokio::time::sleep(wait).await;

        let active = inner.ctl().active;
        if !active {
            return;
        }
        let Ok(gen) = inner.start_once().await else {
            continue;
        };
        {
            let mut ctl = inner.ctl();
            if inner.last_drop.load(Ordering::SeqCst) == gen {
                tracing::debug!(attempt, "link dropped while reconnecting");
                continue;
            }
            ctl.reconnect.take();
        }
        tracing::info!(attempt, "reconnected");
        finish_reconnect(&inner, json!({ "reason": "connected", "attempt": attempt }));
        return;
    }

    tracing::warn!(attempts = policy.attempts, "reconnection exhausted");
    inner.telemetry.emit(
        signal::RECONNECT_EXHAUSTED,
        json!({ "attempts": policy.attempts }),
    );
    // Dropping our own handle detaches; nothing left to abort.
    inner.ctl().reconnect.take();
    finish_reconnect(&inner, json!({ "reason": "exhausted" }));
    let _ = inner.upstream.send(TransportEvent::GaveUp);
}

/// The caller has already released its handle; a loop scheduled since then
/// is left alone.
fn finish_reconnect(inner: &Inner, meta: serde_json::Value) {
    inner.telemetry.emit(signal::RECONNECT_STOP, meta);
    inner.health.report(HealthSignal::TransportReconnecting(false));
}
