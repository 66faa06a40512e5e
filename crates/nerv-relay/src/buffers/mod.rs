//! Inbound/outbound FIFO buffers with observational backpressure.
//!
//! Rejections never block and never touch queued items: `enqueue` returns
//! `false` and a `nerv:buffer:pressure` signal is emitted. Whether to retry,
//! shed or stall is the caller's decision.

pub mod queue;

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;

use nerv_core::protocol::Envelope;

use crate::config::BufferLimits;
use crate::obs::{signal, Effects, HealthMonitor, HealthSignal, TelemetryBus};

pub use queue::BoundedQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

pub struct Buffers {
    inbound: Mutex<BoundedQueue<Envelope>>,
    outbound: Mutex<BoundedQueue<Envelope>>,
    telemetry: Arc<TelemetryBus>,
    health: Arc<HealthMonitor>,
}

impl Buffers {
    pub fn new(limits: &BufferLimits, telemetry: Arc<TelemetryBus>, health: Arc<HealthMonitor>) -> Self {
        Self {
            inbound: Mutex::new(BoundedQueue::new(limits.inbound)),
            outbound: Mutex::new(BoundedQueue::new(limits.outbound)),
            telemetry,
            health,
        }
    }

    fn queue(&self, dir: Direction) -> MutexGuard<'_, BoundedQueue<Envelope>> {
        let m = match dir {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        };
        match m.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn enqueue(&self, dir: Direction, env: Envelope) -> bool {
        let mut fx = Effects::default();
        let ok = self.enqueue_with(dir, env, &mut fx);
        fx.apply(&self.telemetry, &self.health);
        ok
    }

    pub fn dequeue(&self, dir: Direction) -> Option<Envelope> {
        let mut fx = Effects::default();
        let item = self.dequeue_with(dir, &mut fx);
        fx.apply(&self.telemetry, &self.health);
        item
    }

    /// Pull up to `max` items in FIFO order.
    pub fn drain(&self, dir: Direction, max: usize) -> Vec<Envelope> {
        let mut fx = Effects::default();
        let mut out = Vec::new();
        while out.len() < max {
            match self.dequeue_with(dir, &mut fx) {
                Some(env) => out.push(env),
                None => break,
            }
        }
        fx.apply(&self.telemetry, &self.health);
        out
    }

    pub fn size(&self, dir: Direction) -> usize {
        self.queue(dir).size()
    }

    pub fn is_empty(&self, dir: Direction) -> bool {
        self.queue(dir).is_empty()
    }

    pub fn max_size(&self, dir: Direction) -> Option<usize> {
        self.queue(dir).max_size()
    }

    /// Both directions empty.
    pub fn is_idle(&self) -> bool {
        self.is_empty(Direction::Inbound) && self.is_empty(Direction::Outbound)
    }

    pub fn clear(&self, dir: Direction) {
        let mut fx = Effects::default();
        self.clear_with(dir, &mut fx);
        fx.apply(&self.telemetry, &self.health);
    }

    pub fn clear_all(&self) {
        let mut fx = Effects::default();
        self.clear_with(Direction::Inbound, &mut fx);
        self.clear_with(Direction::Outbound, &mut fx);
        fx.apply(&self.telemetry, &self.health);
    }

    pub(crate) fn enqueue_with(&self, dir: Direction, env: Envelope, fx: &mut Effects) -> bool {
        let (accepted, size, limit) = {
            let mut q = self.queue(dir);
            let r = q.enqueue(env);
            (r.is_ok(), q.size(), q.max_size())
        };
        self.gauge(dir, size);

        if accepted {
            fx.signal(signal::BUFFER_ENQUEUE, json!({ "buffer": dir.as_str(), "size": size }));
            fx.health(size_update(dir, size));
        } else {
            tracing::debug!(buffer = dir.as_str(), size, ?limit, "buffer full; enqueue rejected");
            fx.signal(
                signal::BUFFER_PRESSURE,
                json!({ "buffer": dir.as_str(), "size": size, "limit": limit }),
            );
        }
        accepted
    }

    pub(crate) fn dequeue_with(&self, dir: Direction, fx: &mut Effects) -> Option<Envelope> {
        let (item, size, relief) = {
            let mut q = self.queue(dir);
            let item = q.dequeue();
            let relief = item.is_some() && q.take_relief();
            (item, q.size(), relief)
        };

        if item.is_some() {
            self.gauge(dir, size);
            fx.signal(signal::BUFFER_DEQUEUE, json!({ "buffer": dir.as_str(), "size": size }));
            fx.health(size_update(dir, size));
        }
        if relief {
            fx.signal(signal::BUFFER_RELIEF, json!({ "buffer": dir.as_str(), "size": size }));
        }
        item
    }

    pub(crate) fn requeue_front_with(&self, dir: Direction, env: Envelope, fx: &mut Effects) {
        let size = {
            let mut q = self.queue(dir);
            q.push_front(env);
            q.size()
        };
        self.gauge(dir, size);
        fx.health(size_update(dir, size));
    }

    pub(crate) fn clear_with(&self, dir: Direction, fx: &mut Effects) {
        let dropped = self.queue(dir).clear();
        self.gauge(dir, 0);
        fx.signal(signal::BUFFER_CLEARED, json!({ "buffer": dir.as_str(), "dropped": dropped }));
        fx.health(size_update(dir, 0));
    }

    fn gauge(&self, dir: Direction, size: usize) {
        let name = match dir {
            Direction::Inbound => "buffer:inbound:size",
            Direction::Outbound => "buffer:outbound:size",
        };
        self.telemetry.set_gauge(name, size as i64);
    }
}

fn size_update(dir: Direction, size: usize) -> HealthSignal {
    match dir {
        Direction::Inbound => HealthSignal::BufferUpdate {
            inbound: Some(size),
            outbound: None,
        },
        Direction::Outbound => HealthSignal::BufferUpdate {
            inbound: None,
            outbound: Some(size),
        },
    }
}
