#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

mod support;

use std::sync::{Arc, Mutex};

use nerv_core::protocol::{action, ActorId, Envelope, Kind};
use nerv_relay::channel::{Channel, ChannelState};
use nerv_relay::obs::signal;
use nerv_relay::transport::memory_pair;
use nerv_relay::{Mode, RelayConfig, Router, SendOutcome};

use support::{ctx, event, eventually, handshake_ack, kinds, record, wait_state, WAIT};

fn collector() -> (Arc<Mutex<Vec<Envelope>>>, impl Fn(&Envelope) + Send + Sync + 'static) {
    let got = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&got);
    (got, move |env: &Envelope| sink.lock().unwrap().push(env.clone()))
}

#[test]
fn local_send_reaches_every_subscriber() {
    let ctx = ctx(RelayConfig::default());
    let seen = record(&ctx.telemetry());
    let router = Router::local(ctx.telemetry());
    router.start();

    let (a, ha) = collector();
    let (b, hb) = collector();
    let _ = router.on_receive(ha);
    let _ = router.on_receive(hb);

    let env = event(action::DRIVER_TASK_STARTED);
    assert_eq!(router.send(&env), SendOutcome::Delivered);
    assert_eq!(a.lock().unwrap()[0].msg_id(), env.msg_id());
    assert_eq!(b.lock().unwrap().len(), 1);

    let sent = kinds(&seen, signal::ROUTER_SENT);
    assert_eq!(sent[0].meta["mode"], "local");
    assert_eq!(sent[0].meta["outcome"], "delivered");
}

#[test]
fn start_and_stop_are_idempotent() {
    let ctx = ctx(RelayConfig::default());
    let seen = record(&ctx.telemetry());
    let router = Router::local(ctx.telemetry());

    router.start();
    router.start();
    assert!(router.is_running());
    router.stop();
    router.stop();
    assert!(!router.is_running());

    assert_eq!(kinds(&seen, signal::ROUTER_START).len(), 1);
    assert_eq!(kinds(&seen, signal::ROUTER_STOP).len(), 1);
}

#[test]
fn on_event_filters_by_action() {
    let ctx = ctx(RelayConfig::default());
    let router = Router::local(ctx.telemetry());
    let (got, h) = collector();
    let _ = router.on_event(action::DRIVER_ANOMALY, h);

    router.send(&event(action::DRIVER_TASK_STARTED));
    router.send(&event(action::DRIVER_ANOMALY));
    router.send(&event("CUSTOM_PROBE"));

    let got = got.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].action().as_str(), action::DRIVER_ANOMALY);
}

#[test]
fn on_actor_matches_source_or_target() {
    let ctx = ctx(RelayConfig::default());
    let router = Router::local(ctx.telemetry());
    let (kernel, hk) = collector();
    let (driver, hd) = collector();
    let (infra, hi) = collector();
    let _ = router.on_actor(ActorId::Kernel, hk);
    let _ = router.on_actor(ActorId::Driver, hd);
    let _ = router.on_actor(ActorId::Infra, hi);

    // DRIVER -> KERNEL
    router.send(&event(action::DRIVER_TASK_COMPLETED));

    assert_eq!(kernel.lock().unwrap().len(), 1);
    assert_eq!(driver.lock().unwrap().len(), 1);
    assert!(infra.lock().unwrap().is_empty());
}

#[test]
fn extension_actors_are_matched_by_id() {
    let ctx = ctx(RelayConfig::default());
    let router = Router::local(ctx.telemetry());
    let (got, h) = collector();
    let _ = router.on_actor(ActorId::parse("agent:gpt-01").unwrap(), h);

    let to_agent = Envelope::builder(ActorId::Kernel, "agent:gpt-01", Kind::Command, action::TASK_START)
        .build()
        .unwrap();
    let to_other = Envelope::builder(ActorId::Kernel, "agent:gpt-02", Kind::Command, action::TASK_START)
        .build()
        .unwrap();
    router.send(&to_agent);
    router.send(&to_other);

    assert_eq!(got.lock().unwrap().len(), 1);
}

#[test]
fn panicking_handler_does_not_starve_the_rest() {
    let ctx = ctx(RelayConfig::default());
    let seen = record(&ctx.telemetry());
    let router = Router::local(ctx.telemetry());
    let _ = router.on_receive(|_| panic!("handler bug"));
    let (got, h) = collector();
    let _ = router.on_receive(h);

    let env = event(action::DRIVER_TASK_FAILED);
    assert_eq!(router.send(&env), SendOutcome::Delivered);
    assert_eq!(got.lock().unwrap().len(), 1);

    let errs = kinds(&seen, signal::ROUTER_HANDLER_ERROR);
    assert_eq!(errs.len(), 1);
    assert_eq!(errs[0].meta["failures"], 1);
    assert_eq!(errs[0].meta["origin"], "local");
    assert_eq!(errs[0].meta["msg_id"], env.msg_id().to_string());
}

#[test]
fn unsubscribed_handler_is_not_called() {
    let ctx = ctx(RelayConfig::default());
    let router = Router::local(ctx.telemetry());
    let (got, h) = collector();
    let sub = router.on_receive(h);
    assert_eq!(router.status().local_handlers, 1);

    assert!(sub.unsubscribe());
    router.send(&event(action::DRIVER_HEALTH_REPORT));
    assert!(got.lock().unwrap().is_empty());
    assert_eq!(router.status().local_handlers, 0);
}

#[test]
fn inject_skips_the_remote_side() {
    let ctx = ctx(RelayConfig::default());
    let seen = record(&ctx.telemetry());
    let router = Router::local(ctx.telemetry());
    let (got, h) = collector();
    let _ = router.on_receive(h);

    router.inject(&event(action::KERNEL_TELEMETRY));
    assert_eq!(got.lock().unwrap().len(), 1);
    assert!(kinds(&seen, signal::ROUTER_SENT).is_empty());
}

#[test]
fn local_status_has_no_remote_fields() {
    let ctx = ctx(RelayConfig::default());
    let router = Router::local(ctx.telemetry());
    router.start();
    let status = router.status();
    assert_eq!(router.mode(), Mode::Local);
    assert_eq!(status.mode, "local");
    assert!(status.running);
    assert_eq!(status.remote_connected, None);
    assert_eq!(status.channel_state, None);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["localHandlers"], 0);
    assert!(json["remoteConnected"].is_null());
}

#[tokio::test]
async fn hybrid_forwards_and_injects_remote_traffic() {
    let ctx = ctx(RelayConfig::default());
    let seen = record(&ctx.telemetry());
    let (adapter, mut remote) = memory_pair(true);
    let channel = Arc::new(Channel::new(&ctx, Arc::new(adapter)).unwrap());
    let router = Router::hybrid(ctx.telemetry(), Arc::clone(&channel));
    router.start();

    let (got, h) = collector();
    let _ = router.on_receive(h);

    // Not connected yet: delivered locally, parked for the remote.
    let early = event(action::DRIVER_TASK_STARTED);
    assert_eq!(router.send(&early), SendOutcome::Queued);
    assert_eq!(got.lock().unwrap().len(), 1);

    let mut st = channel.subscribe_state();
    channel.connect().await.unwrap();
    let hello = tokio::time::timeout(WAIT, remote.recv_envelope()).await.unwrap().unwrap();
    remote.push_envelope(&handshake_ack(&hello)).unwrap();
    wait_state(&mut st, ChannelState::Ready).await;

    let flushed = tokio::time::timeout(WAIT, remote.recv_envelope()).await.unwrap().unwrap();
    assert_eq!(flushed.msg_id(), early.msg_id());

    let live = event(action::DRIVER_TASK_COMPLETED);
    assert_eq!(router.send(&live), SendOutcome::Sent);
    let forwarded = tokio::time::timeout(WAIT, remote.recv_envelope()).await.unwrap().unwrap();
    assert_eq!(forwarded.msg_id(), live.msg_id());

    // Remote-origin traffic lands on the same local bus.
    let incoming = Envelope::builder(ActorId::Kernel, ActorId::Driver, Kind::Command, action::DRIVER_ABORT)
        .build()
        .unwrap();
    remote.push_envelope(&incoming).unwrap();
    assert!(eventually(|| got.lock().unwrap().len() == 3).await);
    assert_eq!(got.lock().unwrap()[2].msg_id(), incoming.msg_id());

    let status = router.status();
    assert_eq!(status.mode, "hybrid");
    assert_eq!(status.remote_connected, Some(true));
    assert_eq!(status.channel_state, Some(ChannelState::Ready));

    let outcomes: Vec<_> = kinds(&seen, signal::ROUTER_SENT)
        .iter()
        .map(|e| e.meta["outcome"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(outcomes, ["queued", "sent"]);
}

#[tokio::test]
async fn dropping_a_hybrid_router_detaches_it_from_the_channel() {
    let ctx = ctx(RelayConfig::default());
    let (adapter, _remote) = memory_pair(true);
    let channel = Arc::new(Channel::new(&ctx, Arc::new(adapter)).unwrap());

    let router = Router::hybrid(ctx.telemetry(), Arc::clone(&channel));
    assert_eq!(channel.receiver_count(), 1);
    router.stop();
    router.start();
    assert_eq!(channel.receiver_count(), 1);

    drop(router);
    assert_eq!(channel.receiver_count(), 0);
}
