//! Shared fixtures for relay integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use nerv_core::clock::ManualClock;
use nerv_core::protocol::{action, ActorId, Envelope, Kind};
use nerv_relay::channel::ChannelState;
use nerv_relay::obs::{TelemetryBus, TelemetryEvent};
use nerv_relay::{NervContext, RelayConfig};
use tokio::sync::watch;

pub const WAIT: Duration = Duration::from_secs(2);

pub fn ctx(cfg: RelayConfig) -> NervContext {
    NervContext::new(cfg).expect("valid config")
}

pub fn manual_ctx(cfg: RelayConfig, start_ms: i64) -> (NervContext, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(start_ms));
    let ctx = NervContext::with_clock(cfg, clock.clone()).expect("valid config");
    (ctx, clock)
}

pub fn event(action: &str) -> Envelope {
    Envelope::builder(ActorId::Driver, ActorId::Kernel, Kind::Event, action)
        .build()
        .unwrap()
}

pub fn command_to_server(action: &str) -> Envelope {
    Envelope::builder(ActorId::parse("agent:relay").unwrap(), ActorId::Server, Kind::Command, action)
        .build()
        .unwrap()
}

/// What a well-behaved peer answers to our handshake.
pub fn handshake_ack(hello: &Envelope) -> Envelope {
    assert_eq!(hello.kind(), Kind::Command);
    assert_eq!(hello.action().as_str(), action::HANDSHAKE);
    Envelope::ack_for(hello, ActorId::Server)
}

/// Collect every telemetry event emitted from now on.
pub fn record(telemetry: &TelemetryBus) -> Arc<Mutex<Vec<TelemetryEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _ = telemetry.on(move |ev| sink.lock().unwrap().push(ev.clone()));
    seen
}

pub fn kinds(seen: &Arc<Mutex<Vec<TelemetryEvent>>>, kind: &str) -> Vec<TelemetryEvent> {
    seen.lock()
        .unwrap()
        .iter()
        .filter(|e| e.kind == kind)
        .cloned()
        .collect()
}

pub async fn wait_state(rx: &mut watch::Receiver<ChannelState>, want: ChannelState) {
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want}"))
        .expect("state channel closed");
}

/// Poll `cond` until it holds or the wait budget is spent.
pub async fn eventually<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
