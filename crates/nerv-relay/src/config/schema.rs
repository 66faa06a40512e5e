use serde::Deserialize;

use nerv_core::error::{NervError, Result};
use nerv_core::protocol::frame::DEFAULT_MAX_FRAME_BYTES;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    pub version: u32,

    #[serde(default)]
    pub mode: Mode,

    #[serde(default)]
    pub remote: Option<RemoteSection>,

    #[serde(default)]
    pub buffers: BufferLimits,

    #[serde(default)]
    pub health: HealthSection,

    /// Absent means no reconnection.
    #[serde(default)]
    pub reconnect: Option<ReconnectSection>,

    #[serde(default)]
    pub handshake: HandshakeSection,

    #[serde(default)]
    pub correlation: CorrelationSection,

    #[serde(default)]
    pub telemetry: TelemetrySection,

    #[serde(default)]
    pub framing: FramingSection,

    #[serde(default)]
    pub peer: PeerSection,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            version: 1,
            mode: Mode::default(),
            remote: None,
            buffers: BufferLimits::default(),
            health: HealthSection::default(),
            reconnect: None,
            handshake: HandshakeSection::default(),
            correlation: CorrelationSection::default(),
            telemetry: TelemetrySection::default(),
            framing: FramingSection::default(),
            peer: PeerSection::default(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(NervError::UnsupportedVersion);
        }
        if self.mode == Mode::Hybrid && self.remote.is_none() {
            return Err(NervError::Config(
                "remote.address is required when mode is hybrid".into(),
            ));
        }
        if let Some(remote) = &self.remote {
            remote.validate()?;
        }
        if let Some(reconnect) = &self.reconnect {
            reconnect.validate()?;
        }
        self.handshake.validate()?;
        self.correlation.validate()?;
        self.framing.validate()?;
        self.peer.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Local,
    Hybrid,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Local => "local",
            Mode::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteSection {
    pub address: String,
}

impl RemoteSection {
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(NervError::Config("remote.address must not be empty".into()));
        }
        Ok(())
    }
}

/// `null` means unbounded.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferLimits {
    #[serde(default = "default_buffer_limit")]
    pub inbound: Option<usize>,
    #[serde(default = "default_buffer_limit")]
    pub outbound: Option<usize>,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            inbound: default_buffer_limit(),
            outbound: default_buffer_limit(),
        }
    }
}

fn default_buffer_limit() -> Option<usize> {
    Some(1000)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthSection {
    #[serde(default)]
    pub thresholds: HealthThresholds,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthThresholds {
    #[serde(default = "default_buffer_threshold")]
    pub max_inbound_buffer: Option<usize>,
    #[serde(default = "default_buffer_threshold")]
    pub max_outbound_buffer: Option<usize>,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_inbound_buffer: default_buffer_threshold(),
            max_outbound_buffer: default_buffer_threshold(),
        }
    }
}

fn default_buffer_threshold() -> Option<usize> {
    Some(800)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectSection {
    #[serde(default = "default_reconnect_attempts")]
    pub attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_reconnect_delay_max_ms")]
    pub delay_max_ms: u64,
    #[serde(default = "default_reconnect_factor")]
    pub factor: f64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            attempts: default_reconnect_attempts(),
            delay_ms: default_reconnect_delay_ms(),
            delay_max_ms: default_reconnect_delay_max_ms(),
            factor: default_reconnect_factor(),
        }
    }
}

impl ReconnectSection {
    pub fn validate(&self) -> Result<()> {
        if self.delay_ms > self.delay_max_ms {
            return Err(NervError::Config(
                "reconnect.delay_ms must not exceed reconnect.delay_max_ms".into(),
            ));
        }
        if self.factor.is_nan() || self.factor < 1.0 {
            return Err(NervError::Config("reconnect.factor must be >= 1.0".into()));
        }
        Ok(())
    }
}

fn default_reconnect_attempts() -> u32 {
    10
}
fn default_reconnect_delay_ms() -> u64 {
    500
}
fn default_reconnect_delay_max_ms() -> u64 {
    10_000
}
fn default_reconnect_factor() -> f64 {
    2.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandshakeSection {
    #[serde(default = "default_handshake_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Default for HandshakeSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_handshake_timeout_ms(),
            agent_id: default_agent_id(),
            capabilities: Vec::new(),
        }
    }
}

impl HandshakeSection {
    pub fn validate(&self) -> Result<()> {
        if !(100..=120_000).contains(&self.timeout_ms) {
            return Err(NervError::Config(
                "handshake.timeout_ms must be between 100 and 120000".into(),
            ));
        }
        // The agent id doubles as the local actor id on the wire.
        nerv_core::protocol::ActorId::parse(&self.agent_id)
            .map_err(|e| NervError::Config(format!("handshake.agent_id: {e}")))?;
        Ok(())
    }
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}
fn default_agent_id() -> String {
    "agent:relay".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorrelationSection {
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CorrelationSection {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_entries: default_max_entries(),
        }
    }
}

impl CorrelationSection {
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_ms < 10 {
            return Err(NervError::Config(
                "correlation.sweep_interval_ms must be >= 10".into(),
            ));
        }
        if self.ttl_ms == 0 {
            return Err(NervError::Config("correlation.ttl_ms must be > 0".into()));
        }
        Ok(())
    }
}

fn default_ttl_ms() -> u64 {
    3_600_000
}
fn default_sweep_interval_ms() -> u64 {
    60_000
}
fn default_max_entries() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FramingSection {
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for FramingSection {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl FramingSection {
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_bytes < 16 {
            return Err(NervError::Config(
                "framing.max_frame_bytes must be >= 16".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_peer_actor")]
    pub actor: String,
}

impl Default for PeerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            actor: default_peer_actor(),
        }
    }
}

impl PeerSection {
    pub fn validate(&self) -> Result<()> {
        nerv_core::protocol::ActorId::parse(&self.actor)
            .map_err(|e| NervError::Config(format!("peer.actor: {e}")))?;
        Ok(())
    }
}

fn default_listen() -> String {
    "0.0.0.0:3333".into()
}
fn default_peer_actor() -> String {
    "SERVER".into()
}
