//! In-process duplex: a [`MemoryAdapter`] for the relay side and a
//! [`MemoryRemote`] that plays the other end (connects, pushes bytes, reads
//! what the relay sent, drops the link).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use nerv_core::error::{NervError, Result};
use nerv_core::protocol::{self, Envelope, Unpacker};

use super::adapter::{AdapterEvent, AdapterEvents, DuplexAdapter};

struct Shared {
    events: Mutex<Option<AdapterEvents>>,
    connected: AtomicBool,
    auto_connect: bool,
    starts: AtomicU32,
    failing_starts: AtomicU32,
    sent: mpsc::UnboundedSender<Bytes>,
}

impl Shared {
    fn emit(&self, ev: AdapterEvent) -> bool {
        let guard = match self.events.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(tx) => tx.send(ev).is_ok(),
            None => false,
        }
    }
}

/// Build a connected pair. With `auto_connect` the adapter reports
/// `Connected` as soon as it is started; otherwise the remote decides.
pub fn memory_pair(auto_connect: bool) -> (MemoryAdapter, MemoryRemote) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        events: Mutex::new(None),
        connected: AtomicBool::new(false),
        auto_connect,
        starts: AtomicU32::new(0),
        failing_starts: AtomicU32::new(0),
        sent: sent_tx,
    });
    (
        MemoryAdapter {
            shared: Arc::clone(&shared),
        },
        MemoryRemote {
            shared,
            sent: sent_rx,
            unpacker: Unpacker::new(),
            pending: std::collections::VecDeque::new(),
        },
    )
}

pub struct MemoryAdapter {
    shared: Arc<Shared>,
}

#[async_trait]
impl DuplexAdapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn start(&self, events: AdapterEvents) -> Result<()> {
        self.shared.starts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .shared
            .failing_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(NervError::Transport("memory: start refused".into()));
        }

        {
            let mut guard = match self.shared.events.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = Some(events);
        }
        if self.shared.auto_connect {
            self.shared.connected.store(true, Ordering::SeqCst);
            self.shared.emit(AdapterEvent::Connected);
        }
        Ok(())
    }

    async fn stop(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        let mut guard = match self.shared.events.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take();
    }

    fn send(&self, bytes: Bytes) -> Result<()> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(NervError::Transport("memory: not connected".into()));
        }
        self.shared
            .sent
            .send(bytes)
            .map_err(|_| NervError::Transport("memory: remote dropped".into()))
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

/// Test-side handle for the far end of a [`memory_pair`].
pub struct MemoryRemote {
    shared: Arc<Shared>,
    sent: mpsc::UnboundedReceiver<Bytes>,
    unpacker: Unpacker,
    pending: std::collections::VecDeque<Bytes>,
}

impl MemoryRemote {
    /// Report a physical connect. Returns false if the adapter is not started.
    pub fn connect(&self) -> bool {
        self.shared.connected.store(true, Ordering::SeqCst);
        self.shared.emit(AdapterEvent::Connected)
    }

    pub fn disconnect(&self, reason: &str) -> bool {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.emit(AdapterEvent::Disconnected {
            reason: reason.to_owned(),
        })
    }

    pub fn fail(&self, message: &str) -> bool {
        self.shared.emit(AdapterEvent::Error(message.to_owned()))
    }

    /// Push raw bytes toward the relay, as if read from the wire.
    pub fn push(&self, bytes: impl Into<Bytes>) -> bool {
        self.shared.emit(AdapterEvent::Chunk(bytes.into()))
    }

    /// Encode, frame and push one envelope.
    pub fn push_envelope(&self, env: &Envelope) -> Result<bool> {
        let body = protocol::encode(env)?;
        Ok(self.push(protocol::pack(&body)?))
    }

    /// Make the next `n` adapter starts fail.
    pub fn fail_next_starts(&self, n: u32) {
        self.shared.failing_starts.store(n, Ordering::SeqCst);
    }

    /// How many times the adapter was started.
    pub fn starts(&self) -> u32 {
        self.shared.starts.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Next raw chunk written by the relay (a complete packed frame).
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.sent.recv().await
    }

    /// Next frame payload written by the relay, header stripped.
    pub async fn recv_frame(&mut self) -> Option<Bytes> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }
            let chunk = self.sent.recv().await?;
            let pending = &mut self.pending;
            if self.unpacker.push(&chunk, |f| pending.push_back(f)).is_err() {
                return None;
            }
        }
    }

    /// Next envelope written by the relay.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        let frame = self.recv_frame().await?;
        protocol::decode(&frame, 0).ok()
    }

    /// Non-waiting check for anything written by the relay.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.sent.try_recv().ok()
    }
}
