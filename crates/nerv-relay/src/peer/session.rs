use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use nerv_core::error::{NervError, ReasonCode, Result};
use nerv_core::protocol::handshake::is_handshake_command;
use nerv_core::protocol::{self, ActorId, Envelope, HandshakeDescriptor, Unpacker, PROTOCOL_VERSION};

use super::Shared;
use crate::obs::{signal, HealthSignal};

const READ_CHUNK: usize = 8 * 1024;
const OUTBOUND_QUEUE: usize = 1024;

/// One session's outbound queue sender.
#[derive(Clone)]
pub struct Connection {
    pub addr: SocketAddr,
    /// Identity announced in the handshake.
    pub agent_id: String,
    tx: mpsc::Sender<Bytes>,
}

impl Connection {
    /// Queue an envelope for this session. Fails when the queue is full or
    /// the session is gone.
    pub fn send(&self, env: &Envelope) -> Result<()> {
        let frame = protocol::encode(env).and_then(|b| protocol::pack(&b))?;
        self.tx
            .try_send(frame)
            .map_err(|e| NervError::Transport(format!("session queue: {e}")))
    }
}

/// Handshaken sessions by id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, Connection>,
    seq: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            seq: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, id: u64, conn: Connection) {
        self.sessions.insert(id, conn);
    }

    pub fn remove(&self, id: u64) -> Option<Connection> {
        self.sessions.remove(&id).map(|(_, c)| c)
    }

    pub fn get(&self, id: u64) -> Option<Connection> {
        self.sessions.get(&id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Best-effort fan-out to every session. Returns how many accepted it.
    pub fn broadcast(&self, env: &Envelope) -> usize {
        let conns: Vec<Connection> = self.sessions.iter().map(|r| r.value().clone()).collect();
        conns.iter().filter(|c| c.send(env).is_ok()).count()
    }
}

pub(crate) async fn run_session(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
    let id = shared.sessions.next_id();
    let _ = stream.set_nodelay(true);
    let (mut rd, mut wr) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE);

    let mut unpacker = Unpacker::with_max_frame_bytes(shared.ctx.cfg().framing.max_frame_bytes);
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut handshaken = false;

    tracing::debug!(session = id, %addr, "peer session opened");

    let result = loop {
        buf.reserve(READ_CHUNK);
        tokio::select! {
            maybe_out = out_rx.recv() => {
                let Some(frame) = maybe_out else { break Ok(()); };
                if let Err(e) = wr.write_all(&frame).await {
                    break Err(NervError::Transport(format!("write: {e}")));
                }
            }

            read = rd.read_buf(&mut buf) => {
                match read {
                    Ok(0) => break Ok(()),
                    Ok(_) => {}
                    Err(e) => break Err(NervError::Transport(format!("read: {e}"))),
                }

                let mut frames = Vec::new();
                if let Err(e) = unpacker.push(&buf.split(), |f| frames.push(f)) {
                    shared.ctx.telemetry().emit(
                        signal::TRANSPORT_ERROR,
                        json!({ "session": id, "error": e.to_string() }),
                    );
                    break Err(e);
                }

                let mut close = false;
                for frame in frames {
                    match on_frame(&shared, id, addr, &out_tx, &mut handshaken, &frame) {
                        Flow::Continue => {}
                        Flow::Close => {
                            close = true;
                            break;
                        }
                    }
                }
                if close {
                    break Ok(());
                }
            }
        }
    };

    // Flush replies already queued before closing.
    out_rx.close();
    while let Ok(frame) = out_rx.try_recv() {
        if wr.write_all(&frame).await.is_err() {
            break;
        }
    }
    let _ = wr.shutdown().await;

    if shared.sessions.remove(id).is_some() {
        shared
            .ctx
            .telemetry()
            .emit(signal::TRANSPORT_DISCONNECTED, json!({ "session": id, "addr": addr.to_string() }));
    }
    tracing::debug!(session = id, %addr, "peer session closed");
    result
}

enum Flow {
    Continue,
    Close,
}

fn on_frame(
    shared: &Shared,
    id: u64,
    addr: SocketAddr,
    out_tx: &mpsc::Sender<Bytes>,
    handshaken: &mut bool,
    frame: &[u8],
) -> Flow {
    let ctx = &shared.ctx;
    let telemetry = ctx.telemetry();

    let env = match protocol::decode(frame, ctx.now_ms()) {
        Ok(env) => env,
        Err(e) => {
            tracing::debug!(session = id, error = %e, "peer frame rejected");
            telemetry.emit(
                signal::RECEPTION_DROPPED,
                json!({ "session": id, "reason": e.reason_code().as_str(), "error": e.to_string() }),
            );
            return Flow::Continue;
        }
    };

    if env.protocol().version != PROTOCOL_VERSION {
        tracing::warn!(session = id, got = env.protocol().version, "peer protocol mismatch");
        telemetry.emit(
            signal::PROTOCOL_MISMATCH,
            json!({ "session": id, "expected": PROTOCOL_VERSION, "got": env.protocol().version }),
        );
        return Flow::Close;
    }

    if !*handshaken {
        if !is_handshake_command(&env) {
            telemetry.emit(
                signal::RECEPTION_DROPPED,
                json!({
                    "session": id,
                    "reason": ReasonCode::ChannelNotReady.as_str(),
                    "msg_id": env.msg_id().to_string(),
                    "action": env.action().as_str(),
                }),
            );
            return Flow::Continue;
        }

        let agent_id = env
            .payload()
            .parse::<HandshakeDescriptor>()
            .map(|d| d.agent_id)
            .unwrap_or_else(|_| env.source().as_str().to_owned());
        let ack = Envelope::ack_for_at(&env, shared.actor.clone(), ctx.now_ms());
        let reply = protocol::encode(&ack).and_then(|b| protocol::pack(&b));
        let sent = match reply {
            Ok(frame) => out_tx.try_send(frame).is_ok(),
            Err(_) => false,
        };
        if !sent {
            telemetry.emit(
                signal::HANDSHAKE_FAILED,
                json!({ "session": id, "reason": ReasonCode::Transport.as_str() }),
            );
            return Flow::Close;
        }

        *handshaken = true;
        shared.sessions.insert(
            id,
            Connection {
                addr,
                agent_id: agent_id.clone(),
                tx: out_tx.clone(),
            },
        );
        tracing::info!(session = id, %addr, %agent_id, "peer handshake completed");
        telemetry.emit(
            signal::HANDSHAKE_COMPLETED,
            json!({ "session": id, "peer": agent_id, "correlation_id": env.correlation_id().to_string() }),
        );
        ctx.health().report(HealthSignal::TransportConnected);
        return Flow::Continue;
    }

    if is_handshake_command(&env) {
        tracing::debug!(session = id, "duplicate handshake ignored");
        return Flow::Continue;
    }

    ctx.correlation().append(env.correlation_id(), &env);
    ctx.health().report(HealthSignal::Reception);
    shared.router.inject(&env);
    telemetry.emit(
        signal::RECEPTION_DELIVERED,
        json!({
            "session": id,
            "msg_id": env.msg_id().to_string(),
            "kind": env.kind().as_str(),
            "action": env.action().as_str(),
        }),
    );
    Flow::Continue
}

/// Parse the identity a session should answer with.
pub(crate) fn server_actor(raw: &str) -> Result<ActorId> {
    ActorId::parse(raw).map_err(|e| NervError::Config(format!("peer.actor: {e}")))
}
