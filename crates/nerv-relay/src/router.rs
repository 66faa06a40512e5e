//! Hybrid router: in-process fan-out, plus a remote channel in hybrid mode.
//!
//! Local delivery is synchronous and happens first; the remote forward is
//! independent of whether local handlers succeeded. Envelopes arriving from
//! the remote side go through the same local bus, so subscribers cannot tell
//! where a message came from.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use nerv_core::protocol::{ActorId, Envelope};

use crate::channel::{Channel, ChannelState};
use crate::config::Mode;
use crate::obs::{signal, ObserverList, Subscription, TelemetryBus};
use crate::outcome::SendOutcome;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStatus {
    pub mode: &'static str,
    pub running: bool,
    pub local_handlers: usize,
    /// `None` in local mode.
    pub remote_connected: Option<bool>,
    pub channel_state: Option<ChannelState>,
}

pub struct Router {
    mode: Mode,
    telemetry: Arc<TelemetryBus>,
    local: ObserverList<Envelope>,
    channel: Option<Arc<Channel>>,
    /// Hook on the channel's receivers; detached when the router is dropped.
    remote_sub: Option<Subscription>,
    running: AtomicBool,
}

impl Router {
    pub fn local(telemetry: Arc<TelemetryBus>) -> Self {
        Self {
            mode: Mode::Local,
            telemetry,
            local: ObserverList::new(),
            channel: None,
            remote_sub: None,
            running: AtomicBool::new(false),
        }
    }

    /// Remote-origin envelopes delivered by `channel` are injected into the
    /// local bus for as long as the router lives.
    pub fn hybrid(telemetry: Arc<TelemetryBus>, channel: Arc<Channel>) -> Self {
        let local = ObserverList::new();
        let remote_sub = {
            let local = local.clone();
            let telemetry = Arc::clone(&telemetry);
            channel.on_receive(move |env| fan_out(&local, &telemetry, env, "remote"))
        };
        Self {
            mode: Mode::Hybrid,
            telemetry,
            local,
            channel: Some(channel),
            remote_sub: Some(remote_sub),
            running: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn channel(&self) -> Option<&Arc<Channel>> {
        self.channel.as_ref()
    }

    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            tracing::info!(mode = self.mode.as_str(), "router started");
            self.telemetry
                .emit(signal::ROUTER_START, json!({ "mode": self.mode.as_str() }));
        }
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!(mode = self.mode.as_str(), "router stopped");
            self.telemetry
                .emit(signal::ROUTER_STOP, json!({ "mode": self.mode.as_str() }));
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Deliver locally, then forward to the remote channel in hybrid mode.
    /// Local mode reports `Delivered`; hybrid mode reports the channel outcome.
    pub fn send(&self, env: &Envelope) -> SendOutcome {
        fan_out(&self.local, &self.telemetry, env, "local");

        let outcome = match &self.channel {
            Some(channel) => channel.send(env.clone()),
            None => SendOutcome::Delivered,
        };

        self.telemetry.emit(
            signal::ROUTER_SENT,
            json!({
                "mode": self.mode.as_str(),
                "msg_id": env.msg_id().to_string(),
                "outcome": outcome.as_str(),
            }),
        );
        outcome
    }

    /// Inject an envelope into the local bus only.
    pub fn inject(&self, env: &Envelope) {
        fan_out(&self.local, &self.telemetry, env, "inject");
    }

    pub fn on_receive<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.local.subscribe(handler)
    }

    /// Only envelopes whose action equals `action`.
    pub fn on_event<F>(&self, action: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let action = action.into();
        self.local.subscribe(move |env| {
            if env.action().as_str() == action {
                handler(env);
            }
        })
    }

    /// Envelopes sent by or addressed to `actor`.
    pub fn on_actor<F>(&self, actor: ActorId, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.local.subscribe(move |env| {
            if env.source() == &actor || env.target() == &actor {
                handler(env);
            }
        })
    }

    pub fn status(&self) -> RouterStatus {
        RouterStatus {
            mode: self.mode.as_str(),
            running: self.is_running(),
            local_handlers: self.local.len(),
            remote_connected: self.channel.as_ref().map(|c| c.transport().is_connected()),
            channel_state: self.channel.as_ref().map(|c| c.state()),
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        if let Some(sub) = self.remote_sub.take() {
            sub.unsubscribe();
        }
    }
}

fn fan_out(local: &ObserverList<Envelope>, telemetry: &TelemetryBus, env: &Envelope, origin: &str) {
    let failures = local.notify(env);
    if failures > 0 {
        tracing::warn!(failures, origin, msg_id = %env.msg_id(), "local handler panicked");
        telemetry.emit(
            signal::ROUTER_HANDLER_ERROR,
            json!({
                "failures": failures,
                "origin": origin,
                "msg_id": env.msg_id().to_string(),
            }),
        );
    }
}
