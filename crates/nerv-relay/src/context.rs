//! Shared relay context.
//!
//! Built once at startup and handed to every component by `Arc`; nothing in
//! the relay reaches for process-wide state.

use std::sync::Arc;

use nerv_core::clock::{Clock, SystemClock};
use nerv_core::error::Result;
use nerv_core::protocol::ActorId;

use crate::buffers::Buffers;
use crate::config::RelayConfig;
use crate::correlation::CorrelationStore;
use crate::obs::{HealthMonitor, TelemetryBus};

#[derive(Clone)]
pub struct NervContext {
    cfg: Arc<RelayConfig>,
    local_actor: ActorId,
    clock: Arc<dyn Clock>,
    telemetry: Arc<TelemetryBus>,
    health: Arc<HealthMonitor>,
    buffers: Arc<Buffers>,
    correlation: Arc<CorrelationStore>,
}

impl NervContext {
    pub fn new(cfg: RelayConfig) -> Result<Self> {
        Self::with_clock(cfg, Arc::new(SystemClock))
    }

    /// Validates `cfg` and wires every shared component around `clock`.
    pub fn with_clock(cfg: RelayConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        cfg.validate()?;
        let local_actor = ActorId::parse(&cfg.handshake.agent_id)?;

        let telemetry = Arc::new(TelemetryBus::new(cfg.telemetry.enabled, Arc::clone(&clock)));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&telemetry),
            Arc::clone(&clock),
            cfg.health.thresholds.clone(),
        ));
        let buffers = Arc::new(Buffers::new(
            &cfg.buffers,
            Arc::clone(&telemetry),
            Arc::clone(&health),
        ));
        let correlation = Arc::new(CorrelationStore::new(
            &cfg.correlation,
            Arc::clone(&telemetry),
            Arc::clone(&clock),
        ));

        Ok(Self {
            cfg: Arc::new(cfg),
            local_actor,
            clock,
            telemetry,
            health,
            buffers,
            correlation,
        })
    }

    pub fn cfg(&self) -> &RelayConfig {
        &self.cfg
    }

    /// Identity this relay presents on the wire.
    pub fn local_actor(&self) -> &ActorId {
        &self.local_actor
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn telemetry(&self) -> Arc<TelemetryBus> {
        Arc::clone(&self.telemetry)
    }

    pub fn health(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.health)
    }

    pub fn buffers(&self) -> Arc<Buffers> {
        Arc::clone(&self.buffers)
    }

    pub fn correlation(&self) -> Arc<CorrelationStore> {
        Arc::clone(&self.correlation)
    }
}
