//! TCP adapter: one reader task, one writer task, an unbounded writer queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use nerv_core::error::{NervError, Result};

use super::adapter::{AdapterEvent, AdapterEvents, DuplexAdapter};

const READ_CHUNK: usize = 8 * 1024;
const STOP_GRACE: Duration = Duration::from_millis(500);

struct Link {
    writer: mpsc::UnboundedSender<Bytes>,
    tasks: [JoinHandle<()>; 2],
}

pub struct TcpAdapter {
    addr: String,
    link: Mutex<Option<Link>>,
    connected: Arc<AtomicBool>,
}

impl TcpAdapter {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            link: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn take_link(&self) -> Option<Link> {
        match self.link.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

#[async_trait]
impl DuplexAdapter for TcpAdapter {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn start(&self, events: AdapterEvents) -> Result<()> {
        if let Some(old) = self.take_link() {
            old.tasks.iter().for_each(JoinHandle::abort);
        }

        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| NervError::Transport(format!("connect {} failed: {e}", self.addr)))?;
        let _ = stream.set_nodelay(true);
        let (mut rd, mut wr) = stream.into_split();

        // Only the first side to fail reports the drop.
        let closed = Arc::new(AtomicBool::new(false));
        let report_drop = {
            let closed = Arc::clone(&closed);
            let connected = Arc::clone(&self.connected);
            let events = events.clone();
            move |reason: String| {
                connected.store(false, Ordering::SeqCst);
                if !closed.swap(true, Ordering::SeqCst) {
                    let _ = events.send(AdapterEvent::Disconnected { reason });
                }
            }
        };

        let reader = {
            let events = events.clone();
            let report_drop = report_drop.clone();
            tokio::spawn(async move {
                let mut buf = BytesMut::with_capacity(READ_CHUNK);
                loop {
                    buf.reserve(READ_CHUNK);
                    match rd.read_buf(&mut buf).await {
                        Ok(0) => {
                            report_drop("eof".into());
                            break;
                        }
                        Ok(_) => {
                            if events.send(AdapterEvent::Chunk(buf.split().freeze())).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = events.send(AdapterEvent::Error(format!("read: {e}")));
                            report_drop(format!("read failed: {e}"));
                            break;
                        }
                    }
                }
            })
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let writer = {
            let events = events.clone();
            tokio::spawn(async move {
                while let Some(bytes) = rx.recv().await {
                    if let Err(e) = wr.write_all(&bytes).await {
                        let _ = events.send(AdapterEvent::Error(format!("write: {e}")));
                        report_drop(format!("write failed: {e}"));
                        break;
                    }
                }
                let _ = wr.shutdown().await;
            })
        };

        {
            let mut g = match self.link.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            *g = Some(Link {
                writer: tx,
                tasks: [reader, writer],
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!(addr = %self.addr, "tcp adapter connected");
        let _ = events.send(AdapterEvent::Connected);
        Ok(())
    }

    /// Closes the writer queue and gives the writer task a short grace
    /// period to flush what is already queued.
    async fn stop(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(link) = self.take_link() {
            let Link {
                writer,
                tasks: [reader, mut writer_task],
            } = link;
            drop(writer);
            reader.abort();
            if tokio::time::timeout(STOP_GRACE, &mut writer_task).await.is_err() {
                writer_task.abort();
            }
            tracing::debug!(addr = %self.addr, "tcp adapter stopped");
        }
    }

    fn send(&self, bytes: Bytes) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(NervError::Transport("tcp: not connected".into()));
        }
        let g = match self.link.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match g.as_ref() {
            Some(link) => link
                .writer
                .send(bytes)
                .map_err(|_| NervError::Transport("tcp: writer closed".into())),
            None => Err(NervError::Transport("tcp: not connected".into())),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
