use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use nerv_core::error::Result;

/// Physical events reported by an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    Connected,
    /// Raw bytes as read from the wire; frame boundaries are not preserved.
    Chunk(Bytes),
    Disconnected { reason: String },
    Error(String),
}

pub type AdapterEvents = mpsc::UnboundedSender<AdapterEvent>;

/// Pluggable byte-stream duplex.
///
/// `send` must not block: adapters queue bytes for a writer task. The
/// channel state machine calls it while holding its state lock.
#[async_trait]
pub trait DuplexAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open the physical link. Events for this link go to `events` until
    /// `stop` is called or the link drops.
    async fn start(&self, events: AdapterEvents) -> Result<()>;

    /// Close the link. Idempotent; emits no `Disconnected` event.
    async fn stop(&self);

    fn send(&self, bytes: Bytes) -> Result<()>;

    fn is_connected(&self) -> bool;
}
