//! Relay config loader (strict parsing).

pub mod schema;

use std::fs;

use nerv_core::error::{NervError, Result};

pub use schema::{
    BufferLimits, CorrelationSection, FramingSection, HandshakeSection, HealthSection,
    HealthThresholds, Mode, PeerSection, ReconnectSection, RelayConfig, RemoteSection,
    TelemetrySection,
};

pub fn load_from_file(path: &str) -> Result<RelayConfig> {
    let s = fs::read_to_string(path)
        .map_err(|e| NervError::Config(format!("read config failed: {e}")))?;
    load_from_str(&s)
}

pub fn load_from_str(s: &str) -> Result<RelayConfig> {
    let cfg: RelayConfig = serde_yaml::from_str(s)
        .map_err(|e| NervError::Config(format!("invalid yaml: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}
