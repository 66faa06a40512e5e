//! Transport framing, reconnection backoff and cancellation.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

mod support;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;

use nerv_core::protocol::pack;
use nerv_core::NervError;
use nerv_relay::channel::{Channel, ChannelState};
use nerv_relay::config::{FramingSection, ReconnectSection};
use nerv_relay::obs::signal;
use nerv_relay::transport::{
    memory_pair, AdapterEvent, AdapterEvents, DuplexAdapter, ReconnectPolicy, Transport, TransportEvent,
};
use nerv_relay::RelayConfig;

use support::{ctx, eventually, handshake_ack, kinds, record, wait_state, WAIT};

fn reconnecting(attempts: u32, delay_ms: u64) -> RelayConfig {
    RelayConfig {
        reconnect: Some(ReconnectSection {
            attempts,
            delay_ms,
            delay_max_ms: delay_ms * 4,
            factor: 2.0,
        }),
        ..RelayConfig::default()
    }
}

/// Accepts and then immediately loses the link for its first `flaky`
/// starts; the drop is reported before `start` returns.
struct FlakyAdapter {
    flaky: u32,
    starts: AtomicU32,
    connected: AtomicBool,
}

impl FlakyAdapter {
    fn new(flaky: u32) -> Arc<Self> {
        Arc::new(Self {
            flaky,
            starts: AtomicU32::new(0),
            connected: AtomicBool::new(false),
        })
    }

    fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DuplexAdapter for FlakyAdapter {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn start(&self, events: AdapterEvents) -> nerv_core::Result<()> {
        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = events.send(AdapterEvent::Connected);
        if n <= self.flaky {
            let _ = events.send(AdapterEvent::Disconnected {
                reason: "closed by peer".into(),
            });
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.connected.store(false, Ordering::SeqCst);
        } else {
            self.connected.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn stop(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn send(&self, _bytes: Bytes) -> nerv_core::Result<()> {
        Err(NervError::Transport("flaky: not writable".into()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn next(events: &mut UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("no transport event")
        .expect("transport event stream closed")
}

#[test]
fn backoff_grows_and_caps() {
    let policy = ReconnectPolicy::from_config(&ReconnectSection {
        attempts: 10,
        delay_ms: 100,
        delay_max_ms: 1_000,
        factor: 2.0,
    });
    let got: Vec<u64> = (1..=6).map(|n| policy.delay_for(n).as_millis() as u64).collect();
    assert_eq!(got, [100, 200, 400, 800, 1_000, 1_000]);
    assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(1_000));
}

#[test]
fn factor_one_is_a_constant_delay() {
    let policy = ReconnectPolicy::from_config(&ReconnectSection {
        attempts: 3,
        delay_ms: 250,
        delay_max_ms: 250,
        factor: 1.0,
    });
    assert_eq!(policy.delay_for(1), policy.delay_for(3));
}

#[tokio::test]
async fn chunks_are_reassembled_into_frames() {
    let ctx = ctx(RelayConfig::default());
    let (adapter, remote) = memory_pair(true);
    let (transport, mut events) = Transport::new(&ctx, Arc::new(adapter));
    transport.start().await.unwrap();
    assert_eq!(next(&mut events).await, TransportEvent::Connected);

    let mut wire = pack(b"first").unwrap().to_vec();
    wire.extend_from_slice(&pack(b"second").unwrap());
    let (a, b) = wire.split_at(7);
    remote.push(a.to_vec());
    remote.push(b.to_vec());

    assert_eq!(next(&mut events).await, TransportEvent::Frame("first".into()));
    assert_eq!(next(&mut events).await, TransportEvent::Frame("second".into()));
    assert_eq!(transport.adapter_name(), "memory");
}

#[tokio::test]
async fn oversized_frame_drops_the_link() {
    let ctx = ctx(RelayConfig {
        framing: FramingSection { max_frame_bytes: 64 },
        ..RelayConfig::default()
    });
    let seen = record(&ctx.telemetry());
    let (adapter, remote) = memory_pair(true);
    let (transport, mut events) = Transport::new(&ctx, Arc::new(adapter));
    transport.start().await.unwrap();
    assert_eq!(next(&mut events).await, TransportEvent::Connected);

    remote.push(pack(&[0u8; 65]).unwrap());
    assert!(matches!(next(&mut events).await, TransportEvent::Error(_)));
    assert!(matches!(next(&mut events).await, TransportEvent::Disconnected { .. }));
    assert!(!remote.is_connected());
    assert_eq!(kinds(&seen, signal::TRANSPORT_ERROR).len(), 1);
    assert_eq!(ctx.health().status().transport.connected, Some(false));
}

#[tokio::test]
async fn send_on_idle_adapter_is_reported_not_raised() {
    let ctx = ctx(RelayConfig::default());
    let seen = record(&ctx.telemetry());
    let (adapter, _remote) = memory_pair(false);
    let (transport, _events) = Transport::new(&ctx, Arc::new(adapter));

    assert!(!transport.send(b"{}"));
    let failed = kinds(&seen, signal::TRANSPORT_SEND_FAILED);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].meta["reason"], "TRANSPORT");
}

#[tokio::test(start_paused = true)]
async fn unexpected_drop_reconnects() {
    let ctx = ctx(reconnecting(3, 50));
    let seen = record(&ctx.telemetry());
    let (adapter, remote) = memory_pair(true);
    let (transport, mut events) = Transport::new(&ctx, Arc::new(adapter));
    transport.start().await.unwrap();
    assert_eq!(next(&mut events).await, TransportEvent::Connected);

    remote.disconnect("reset by peer");
    assert_eq!(
        next(&mut events).await,
        TransportEvent::Disconnected { reason: "reset by peer".into() }
    );
    assert_eq!(next(&mut events).await, TransportEvent::Connected);
    assert_eq!(remote.starts(), 2);
    assert!(eventually(|| !transport.is_reconnecting()).await);

    assert_eq!(kinds(&seen, signal::RECONNECT_START).len(), 1);
    assert_eq!(kinds(&seen, signal::RECONNECT_ATTEMPT).len(), 1);
    let stop = kinds(&seen, signal::RECONNECT_STOP);
    assert_eq!(stop[0].meta["reason"], "connected");
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_give_up() {
    let ctx = ctx(reconnecting(3, 20));
    let seen = record(&ctx.telemetry());
    let (adapter, remote) = memory_pair(true);
    let (transport, mut events) = Transport::new(&ctx, Arc::new(adapter));
    transport.start().await.unwrap();
    assert_eq!(next(&mut events).await, TransportEvent::Connected);

    remote.fail_next_starts(10);
    remote.disconnect("gone");
    assert!(matches!(next(&mut events).await, TransportEvent::Disconnected { .. }));
    assert_eq!(next(&mut events).await, TransportEvent::GaveUp);

    assert_eq!(remote.starts(), 4);
    assert_eq!(kinds(&seen, signal::RECONNECT_ATTEMPT).len(), 3);
    assert_eq!(kinds(&seen, signal::RECONNECT_EXHAUSTED).len(), 1);
    assert!(!transport.is_reconnecting());
    assert!(!ctx.health().status().transport.reconnecting);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_pending_backoff() {
    let ctx = ctx(reconnecting(5, 10_000));
    let seen = record(&ctx.telemetry());
    let (adapter, remote) = memory_pair(true);
    let (transport, mut events) = Transport::new(&ctx, Arc::new(adapter));
    transport.start().await.unwrap();
    assert_eq!(next(&mut events).await, TransportEvent::Connected);

    remote.disconnect("flap");
    assert!(matches!(next(&mut events).await, TransportEvent::Disconnected { .. }));
    assert!(transport.is_reconnecting());

    transport.stop().await;
    assert!(!transport.is_reconnecting());
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(remote.starts(), 1);

    let stops = kinds(&seen, signal::RECONNECT_STOP);
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].meta["reason"], "cancelled");

    // Idempotent.
    transport.stop().await;
    assert_eq!(kinds(&seen, signal::RECONNECT_STOP).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_start_schedules_reconnect() {
    let ctx = ctx(reconnecting(2, 30));
    let (adapter, remote) = memory_pair(true);
    remote.fail_next_starts(1);
    let (transport, mut events) = Transport::new(&ctx, Arc::new(adapter));

    assert!(transport.start().await.is_err());
    assert!(transport.is_reconnecting());
    assert_eq!(
        ctx.health().status().transport.last_error.as_deref(),
        Some("transport: memory: start refused")
    );

    assert_eq!(next(&mut events).await, TransportEvent::Connected);
    assert_eq!(remote.starts(), 2);
    assert_eq!(ctx.health().status().transport.last_error, None);
}

#[tokio::test(start_paused = true)]
async fn channel_handshakes_again_after_reconnect() {
    let ctx = ctx(reconnecting(3, 50));
    let (adapter, mut remote) = memory_pair(true);
    let channel = Channel::new(&ctx, Arc::new(adapter)).unwrap();
    let mut st = channel.subscribe_state();

    channel.connect().await.unwrap();
    wait_state(&mut st, ChannelState::Handshaking).await;
    let hello = remote.recv_envelope().await.unwrap();
    remote.push_envelope(&handshake_ack(&hello)).unwrap();
    wait_state(&mut st, ChannelState::Ready).await;

    remote.disconnect("blip");
    wait_state(&mut st, ChannelState::Disconnected).await;
    wait_state(&mut st, ChannelState::Handshaking).await;

    let again = remote.recv_envelope().await.unwrap();
    assert_ne!(again.msg_id(), hello.msg_id());
    remote.push_envelope(&handshake_ack(&again)).unwrap();
    wait_state(&mut st, ChannelState::Ready).await;
    assert_eq!(remote.starts(), 2);
}

#[tokio::test(start_paused = true)]
async fn channel_gives_up_when_reconnection_is_exhausted() {
    let ctx = ctx(reconnecting(1, 10));
    let (adapter, remote) = memory_pair(true);
    let channel = Channel::new(&ctx, Arc::new(adapter)).unwrap();
    let mut st = channel.subscribe_state();
    channel.connect().await.unwrap();
    wait_state(&mut st, ChannelState::Handshaking).await;

    remote.fail_next_starts(5);
    remote.disconnect("gone");
    wait_state(&mut st, ChannelState::Disconnected).await;
    assert!(eventually(|| !channel.transport().is_reconnecting()).await);
    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert_eq!(remote.starts(), 2);
}

#[tokio::test(start_paused = true)]
async fn drop_during_a_reconnect_attempt_is_retried() {
    let ctx = ctx(reconnecting(5, 10));
    let seen = record(&ctx.telemetry());
    let adapter = FlakyAdapter::new(2);
    let (transport, mut events) = Transport::new(&ctx, adapter.clone());
    transport.start().await.unwrap();

    let mut got = Vec::new();
    for _ in 0..5 {
        got.push(next(&mut events).await);
    }
    let dropped = TransportEvent::Disconnected {
        reason: "closed by peer".into(),
    };
    assert_eq!(
        got,
        [
            TransportEvent::Connected,
            dropped.clone(),
            TransportEvent::Connected,
            dropped,
            TransportEvent::Connected,
        ]
    );
    assert!(eventually(|| !transport.is_reconnecting()).await);
    assert_eq!(adapter.starts(), 3);
    assert!(adapter.is_connected());

    assert_eq!(kinds(&seen, signal::RECONNECT_ATTEMPT).len(), 2);
    let stops = kinds(&seen, signal::RECONNECT_STOP);
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].meta["reason"], "connected");
    assert_eq!(stops[0].meta["attempt"], 2);
}

#[tokio::test(start_paused = true)]
async fn links_that_never_stay_up_exhaust_the_policy() {
    let ctx = ctx(reconnecting(2, 10));
    let seen = record(&ctx.telemetry());
    let adapter = FlakyAdapter::new(u32::MAX);
    let (transport, mut events) = Transport::new(&ctx, adapter.clone());
    transport.start().await.unwrap();

    let mut last = next(&mut events).await;
    while last != TransportEvent::GaveUp {
        last = next(&mut events).await;
    }
    assert_eq!(adapter.starts(), 3);
    assert!(!transport.is_reconnecting());
    assert_eq!(kinds(&seen, signal::RECONNECT_EXHAUSTED).len(), 1);
}
