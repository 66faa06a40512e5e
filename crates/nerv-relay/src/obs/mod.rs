//! Observability: telemetry bus, health monitor, observer lists.

pub mod health;
pub mod observers;
pub mod telemetry;

use serde_json::Value;

pub use health::{HealthMonitor, HealthSignal, HealthSnapshot};
pub use observers::{ObserverList, Subscription};
pub use telemetry::{signal, TelemetryBus, TelemetryEvent, TelemetryStats};

/// Side effects collected while a lock is held and applied once it is
/// released, so telemetry subscribers and health listeners may call back in.
#[derive(Debug, Default)]
pub struct Effects {
    signals: Vec<(&'static str, Value)>,
    health: Vec<HealthSignal>,
}

impl Effects {
    pub fn signal(&mut self, kind: &'static str, meta: Value) {
        self.signals.push((kind, meta));
    }

    pub fn health(&mut self, sig: HealthSignal) {
        self.health.push(sig);
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty() && self.health.is_empty()
    }

    pub fn apply(self, telemetry: &TelemetryBus, health: &HealthMonitor) {
        for (kind, meta) in self.signals {
            telemetry.emit(kind, meta);
        }
        for sig in self.health {
            health.report(sig);
        }
    }
}
