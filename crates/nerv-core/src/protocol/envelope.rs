//! Canonical envelope model.
//!
//! An [`Envelope`] is immutable once built: fields are private, accessors hand
//! out shared references, and the payload is kept as raw JSON behind an `Arc`
//! so it is carried byte-for-byte without ever being re-interpreted.
//!
//! Construction goes through [`EnvelopeBuilder`], which enforces the
//! construction-time rules (recognized actors, non-empty action, ACK without
//! semantic payload). Decoding from the wire goes through
//! [`crate::protocol::codec`], which only enforces structure.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{NervError, Result};
use crate::protocol::PROTOCOL_VERSION;

/// Ontological message kind (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Kind {
    /// Declared intent of a future action.
    Command,
    /// Recorded observation.
    Event,
    /// Technical receipt confirmation.
    Ack,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Command => "COMMAND",
            Kind::Event => "EVENT",
            Kind::Ack => "ACK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "COMMAND" => Some(Kind::Command),
            "EVENT" => Some(Kind::Event),
            "ACK" => Some(Kind::Ack),
            _ => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who sends / who receives. Closed set of roles plus namespaced extensions
/// (`"<namespace>:<name>"`, e.g. `agent:gpt-01`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActorId {
    Kernel,
    Server,
    Infra,
    Observer,
    Maestro,
    Driver,
    Agent,
    Supervisor,
    Guest,
    Extension(Arc<str>),
}

impl ActorId {
    /// Parse a recognized role or a namespaced extension id.
    pub fn parse(s: &str) -> Result<Self> {
        let actor = match s {
            "KERNEL" => ActorId::Kernel,
            "SERVER" => ActorId::Server,
            "INFRA" => ActorId::Infra,
            "OBSERVER" => ActorId::Observer,
            "MAESTRO" => ActorId::Maestro,
            "DRIVER" => ActorId::Driver,
            "AGENT" => ActorId::Agent,
            "SUPERVISOR" => ActorId::Supervisor,
            "GUEST" => ActorId::Guest,
            other => match other.split_once(':') {
                Some((ns, name))
                    if !ns.is_empty()
                        && !name.is_empty()
                        && !other.chars().any(char::is_whitespace) =>
                {
                    ActorId::Extension(Arc::from(other))
                }
                _ => {
                    return Err(NervError::Construction(format!(
                        "unrecognized actor id: {other:?}"
                    )))
                }
            },
        };
        Ok(actor)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ActorId::Kernel => "KERNEL",
            ActorId::Server => "SERVER",
            ActorId::Infra => "INFRA",
            ActorId::Observer => "OBSERVER",
            ActorId::Maestro => "MAESTRO",
            ActorId::Driver => "DRIVER",
            ActorId::Agent => "AGENT",
            ActorId::Supervisor => "SUPERVISOR",
            ActorId::Guest => "GUEST",
            ActorId::Extension(id) => id,
        }
    }

    pub fn is_extension(&self) -> bool {
        matches!(self, ActorId::Extension(_))
    }
}

impl AsRef<str> for ActorId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActorId {
    type Err = NervError;

    fn from_str(s: &str) -> Result<Self> {
        ActorId::parse(s)
    }
}

impl Serialize for ActorId {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ActorId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        ActorId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Well-known action codes. The vocabulary is open: collaborators may use any
/// non-empty string.
pub mod action {
    pub const HANDSHAKE: &str = "HANDSHAKE";

    pub const TASK_START: &str = "TASK_START";
    pub const TASK_CANCEL: &str = "TASK_CANCEL";
    pub const TASK_RETRY: &str = "TASK_RETRY";
    pub const TASK_FAILED: &str = "TASK_FAILED";
    pub const TASK_REJECTED: &str = "TASK_REJECTED";
    pub const PROPOSE_TASK: &str = "PROPOSE_TASK";

    pub const ENGINE_PAUSE: &str = "ENGINE_PAUSE";
    pub const ENGINE_RESUME: &str = "ENGINE_RESUME";
    pub const ENGINE_STOP: &str = "ENGINE_STOP";

    pub const DRIVER_EXECUTE_TASK: &str = "DRIVER_EXECUTE_TASK";
    pub const DRIVER_ABORT: &str = "DRIVER_ABORT";
    pub const DRIVER_TASK_STARTED: &str = "DRIVER_TASK_STARTED";
    pub const DRIVER_TASK_COMPLETED: &str = "DRIVER_TASK_COMPLETED";
    pub const DRIVER_TASK_FAILED: &str = "DRIVER_TASK_FAILED";
    pub const DRIVER_HEALTH_REPORT: &str = "DRIVER_HEALTH_REPORT";
    pub const DRIVER_ANOMALY: &str = "DRIVER_ANOMALY";

    pub const KERNEL_HEALTH_CHECK: &str = "KERNEL_HEALTH_CHECK";
    pub const KERNEL_TELEMETRY: &str = "KERNEL_TELEMETRY";

    pub const STALL_DETECTED: &str = "STALL_DETECTED";
    pub const SECURITY_VIOLATION: &str = "SECURITY_VIOLATION";
}

/// Open-vocabulary action string (non-empty).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionCode(Arc<str>);

impl ActionCode {
    pub fn new(s: impl AsRef<str>) -> Result<Self> {
        let s = s.as_ref();
        if s.trim().is_empty() {
            return Err(NervError::Construction("action must not be empty".into()));
        }
        Ok(Self(Arc::from(s)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for ActionCode {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl PartialEq<&str> for ActionCode {
    fn eq(&self, other: &&str) -> bool {
        &*self.0 == *other
    }
}

impl fmt::Display for ActionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ActionCode {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

/// Opaque payload: a JSON object kept as raw text (zero re-encoding).
#[derive(Debug, Clone)]
pub struct Payload(Arc<RawValue>);

impl Payload {
    /// `{}`.
    pub fn empty() -> Self {
        // "{}" is always valid JSON; the fallback keeps this path panic-free.
        match RawValue::from_string("{}".to_owned()) {
            Ok(raw) => Self(Arc::from(raw)),
            Err(_) => Self(Arc::from(RawValue::NULL.to_owned())),
        }
    }

    /// Wrap raw JSON; rejects anything that is not a plain object.
    pub fn from_raw(raw: Box<RawValue>) -> Result<Self> {
        if !raw.get().trim_start().starts_with('{') {
            return Err(NervError::Structure("payload must be a plain object".into()));
        }
        Ok(Self(Arc::from(raw)))
    }

    /// Serialize any value; it must serialize to a JSON object.
    pub fn from_json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let raw = serde_json::value::to_raw_value(value)
            .map_err(|e| NervError::Construction(format!("payload encode failed: {e}")))?;
        Self::from_raw(raw)
    }

    /// Raw JSON text, exactly as received or produced.
    pub fn get(&self) -> &str {
        self.0.get()
    }

    /// True for `{}` (whitespace-insensitive).
    pub fn is_empty_object(&self) -> bool {
        let s = self.0.get().trim();
        s.strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .map(|inner| inner.trim().is_empty())
            .unwrap_or(false)
    }

    /// Lazy typed view for collaborators; the core itself never calls this.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(self.0.get())
            .map_err(|e| NervError::Structure(format!("payload decode failed: {e}")))
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.0.get() == other.0.get()
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        (*self.0).serialize(s)
    }
}

/// Wire/protocol metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Protocol {
    pub version: u32,
    pub timestamp: i64,
}

/// Sender and addressee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub source: ActorId,
    pub target: ActorId,
}

/// Causal bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Causality {
    pub msg_id: Uuid,
    pub correlation_id: Uuid,
}

/// `type` block: closed kind + open action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageType {
    pub kind: Kind,
    pub action: ActionCode,
}

/// The immutable unit of communication.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    protocol: Protocol,
    identity: Identity,
    causality: Causality,
    #[serde(rename = "type")]
    message_type: MessageType,
    payload: Payload,
}

impl Envelope {
    /// Start building an envelope; validation happens in [`EnvelopeBuilder::build`].
    pub fn builder(
        source: impl AsRef<str>,
        target: impl AsRef<str>,
        kind: Kind,
        action: impl AsRef<str>,
    ) -> EnvelopeBuilder {
        EnvelopeBuilder {
            source: source.as_ref().to_owned(),
            target: target.as_ref().to_owned(),
            kind,
            action: action.as_ref().to_owned(),
            payload: None,
            msg_id: None,
            correlation_id: None,
            timestamp: None,
        }
    }

    /// Technical ACK for `original`: same action and correlation, empty payload,
    /// addressed back to the original source.
    pub fn ack_for(original: &Envelope, source: ActorId) -> Envelope {
        Self::ack_for_at(original, source, SystemClock.now_ms())
    }

    /// [`Envelope::ack_for`] stamped with `now_ms` from the caller's clock.
    pub fn ack_for_at(original: &Envelope, source: ActorId, now_ms: i64) -> Envelope {
        Envelope {
            protocol: Protocol {
                version: PROTOCOL_VERSION,
                timestamp: now_ms,
            },
            identity: Identity {
                source,
                target: original.identity.source.clone(),
            },
            causality: Causality {
                msg_id: Uuid::new_v4(),
                correlation_id: original.causality.correlation_id,
            },
            message_type: MessageType {
                kind: Kind::Ack,
                action: original.message_type.action.clone(),
            },
            payload: Payload::empty(),
        }
    }

    /// Assemble from already-validated parts (decode path).
    pub(crate) fn from_parts(
        protocol: Protocol,
        identity: Identity,
        causality: Causality,
        message_type: MessageType,
        payload: Payload,
    ) -> Self {
        Self {
            protocol,
            identity,
            causality,
            message_type,
            payload,
        }
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }
    pub fn identity(&self) -> &Identity {
        &self.identity
    }
    pub fn causality(&self) -> &Causality {
        &self.causality
    }
    pub fn message_type(&self) -> &MessageType {
        &self.message_type
    }
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn kind(&self) -> Kind {
        self.message_type.kind
    }
    pub fn action(&self) -> &ActionCode {
        &self.message_type.action
    }
    pub fn source(&self) -> &ActorId {
        &self.identity.source
    }
    pub fn target(&self) -> &ActorId {
        &self.identity.target
    }
    pub fn msg_id(&self) -> Uuid {
        self.causality.msg_id
    }
    pub fn correlation_id(&self) -> Uuid {
        self.causality.correlation_id
    }

    /// True when this envelope opens its own causal chain.
    pub fn starts_chain(&self) -> bool {
        self.causality.msg_id == self.causality.correlation_id
    }
}

/// Construction-time validator for envelopes (fail-fast for programmer errors).
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    source: String,
    target: String,
    kind: Kind,
    action: String,
    payload: Option<Payload>,
    msg_id: Option<Uuid>,
    correlation_id: Option<Uuid>,
    timestamp: Option<i64>,
}

impl EnvelopeBuilder {
    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Continue an existing causal chain.
    pub fn correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn msg_id(mut self, id: Uuid) -> Self {
        self.msg_id = Some(id);
        self
    }

    pub fn timestamp(mut self, ms: i64) -> Self {
        self.timestamp = Some(ms);
        self
    }

    pub fn build(self) -> Result<Envelope> {
        let source = ActorId::parse(&self.source)?;
        let target = ActorId::parse(&self.target)?;
        let action = ActionCode::new(&self.action)?;
        let payload = self.payload.unwrap_or_else(Payload::empty);

        if self.kind == Kind::Ack && !payload.is_empty_object() {
            return Err(NervError::Construction(
                "ACK must not carry semantic payload".into(),
            ));
        }

        let msg_id = self.msg_id.unwrap_or_else(Uuid::new_v4);
        let correlation_id = self.correlation_id.unwrap_or(msg_id);

        Ok(Envelope {
            protocol: Protocol {
                version: PROTOCOL_VERSION,
                timestamp: self.timestamp.unwrap_or_else(|| SystemClock.now_ms()),
            },
            identity: Identity { source, target },
            causality: Causality {
                msg_id,
                correlation_id,
            },
            message_type: MessageType {
                kind: self.kind,
                action,
            },
            payload,
        })
    }
}
