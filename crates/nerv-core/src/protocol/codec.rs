//! Structural codec: raw wire shape -> normalized -> validated -> [`Envelope`].
//!
//! Validation here is structural only (presence and types). Meaning of
//! `action` and of the payload belongs to collaborators.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{NervError, Result};
use crate::protocol::envelope::{
    ActionCode, ActorId, Causality, Envelope, Identity, Kind, MessageType, Payload, Protocol,
};
use crate::protocol::PROTOCOL_VERSION;

/// Lenient wire shape. Every block is optional so that missing fields become
/// validation reasons instead of opaque decode failures.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causality: Option<Value>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<Value>,
    /// Kept raw (lazy parsing, byte-for-byte preservation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
}

impl RawEnvelope {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| NervError::Structure(format!("invalid envelope json: {e}")))
    }
}

/// Fill `protocol.version` / `protocol.timestamp` when absent.
///
/// Never invents identity or causality values: their absence stays a
/// validation failure.
pub fn normalize(mut raw: RawEnvelope, now_ms: i64) -> RawEnvelope {
    match raw.protocol.as_mut() {
        None => {
            let mut m = Map::new();
            m.insert("version".into(), Value::from(PROTOCOL_VERSION));
            m.insert("timestamp".into(), Value::from(now_ms));
            raw.protocol = Some(Value::Object(m));
        }
        Some(Value::Object(m)) => {
            m.entry("version")
                .or_insert_with(|| Value::from(PROTOCOL_VERSION));
            m.entry("timestamp").or_insert_with(|| Value::from(now_ms));
        }
        // Wrong type: left for validate_structure to report.
        Some(_) => {}
    }
    raw
}

/// Structural check. Returns a descriptive reason on failure; never panics.
pub fn validate_structure(raw: &RawEnvelope) -> std::result::Result<(), String> {
    let protocol = object(&raw.protocol, "protocol")?;
    match protocol.get("version") {
        Some(v) if version_of(v).is_some() => {}
        Some(_) => return Err("protocol.version must be a non-negative integral number".into()),
        None => return Err("protocol.version is required".into()),
    }
    match protocol.get("timestamp") {
        Some(v) if v.as_i64().is_some() => {}
        Some(_) => return Err("protocol.timestamp must be an integer".into()),
        None => return Err("protocol.timestamp is required".into()),
    }

    let identity = object(&raw.identity, "identity")?;
    non_empty_str(identity, "identity", "source")?;
    non_empty_str(identity, "identity", "target")?;

    let causality = object(&raw.causality, "causality")?;
    for field in ["msgId", "correlationId"] {
        let s = non_empty_str(causality, "causality", field)?;
        if !is_uuid_shaped(s) {
            return Err(format!("causality.{field} must be a UUID"));
        }
    }

    let ty = object(&raw.message_type, "type")?;
    let kind = non_empty_str(ty, "type", "kind")?;
    if Kind::parse(kind).is_none() {
        return Err(format!("type.kind must be COMMAND, EVENT or ACK (got {kind:?})"));
    }
    non_empty_str(ty, "type", "action")?;

    match &raw.payload {
        Some(p) if p.get().trim_start().starts_with('{') => Ok(()),
        Some(_) => Err("payload must be a plain object".into()),
        None => Err("payload is required".into()),
    }
}

/// Validate and convert into the typed envelope.
pub fn into_envelope(raw: RawEnvelope) -> Result<Envelope> {
    validate_structure(&raw).map_err(NervError::Structure)?;

    // Every lookup below is guaranteed by validate_structure; the errors only
    // exist to stay panic-free.
    let missing = || NervError::Structure("envelope changed during validation".into());

    let protocol = raw.protocol.as_ref().and_then(Value::as_object).ok_or_else(missing)?;
    let version = protocol.get("version").and_then(version_of).ok_or_else(missing)?;
    let timestamp = protocol.get("timestamp").and_then(Value::as_i64).ok_or_else(missing)?;

    let identity = raw.identity.as_ref().and_then(Value::as_object).ok_or_else(missing)?;
    let source = str_field(identity, "source").ok_or_else(missing)?;
    let target = str_field(identity, "target").ok_or_else(missing)?;
    let source = ActorId::parse(source).map_err(|e| NervError::Structure(e.to_string()))?;
    let target = ActorId::parse(target).map_err(|e| NervError::Structure(e.to_string()))?;

    let causality = raw.causality.as_ref().and_then(Value::as_object).ok_or_else(missing)?;
    let msg_id = parse_uuid(str_field(causality, "msgId").ok_or_else(missing)?)?;
    let correlation_id = parse_uuid(str_field(causality, "correlationId").ok_or_else(missing)?)?;

    let ty = raw.message_type.as_ref().and_then(Value::as_object).ok_or_else(missing)?;
    let kind = str_field(ty, "kind").and_then(Kind::parse).ok_or_else(missing)?;
    let action = ActionCode::new(str_field(ty, "action").ok_or_else(missing)?)
        .map_err(|e| NervError::Structure(e.to_string()))?;

    let payload = Payload::from_raw(raw.payload.ok_or_else(missing)?)?;

    Ok(Envelope::from_parts(
        Protocol { version, timestamp },
        Identity { source, target },
        Causality {
            msg_id,
            correlation_id,
        },
        MessageType { kind, action },
        payload,
    ))
}

/// Bytes -> envelope (parse, normalize, validate).
pub fn decode(bytes: &[u8], now_ms: i64) -> Result<Envelope> {
    let raw = RawEnvelope::from_slice(bytes)?;
    into_envelope(normalize(raw, now_ms))
}

/// Envelope -> JSON bytes.
pub fn encode(env: &Envelope) -> Result<Bytes> {
    serde_json::to_vec(env)
        .map(Bytes::from)
        .map_err(|e| NervError::Internal(format!("envelope encode failed: {e}")))
}

/// `8-4-4-4-12` hex groups.
pub fn is_uuid_shaped(s: &str) -> bool {
    let groups: Vec<&str> = s.split('-').collect();
    let lens = [8, 4, 4, 4, 12];
    groups.len() == lens.len()
        && groups
            .iter()
            .zip(lens)
            .all(|(g, n)| g.len() == n && g.chars().all(|c| c.is_ascii_hexdigit()))
}

fn object<'a>(v: &'a Option<Value>, name: &str) -> std::result::Result<&'a Map<String, Value>, String> {
    match v {
        Some(Value::Object(m)) => Ok(m),
        Some(_) => Err(format!("{name} must be an object")),
        None => Err(format!("{name} block is required")),
    }
}

fn non_empty_str<'a>(
    m: &'a Map<String, Value>,
    block: &str,
    field: &str,
) -> std::result::Result<&'a str, String> {
    match m.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(Value::String(_)) => Err(format!("{block}.{field} must not be empty")),
        Some(_) => Err(format!("{block}.{field} must be a string")),
        None => Err(format!("{block}.{field} is required")),
    }
}

/// `2` and `2.0` are the same version; `2.5` is not a version.
fn version_of(v: &Value) -> Option<u32> {
    if let Some(n) = v.as_u64() {
        return u32::try_from(n).ok();
    }
    let f = v.as_f64()?;
    if f.fract() == 0.0 && (0.0..=u32::MAX as f64).contains(&f) {
        Some(f as u32)
    } else {
        None
    }
}

fn str_field<'a>(m: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    m.get(field).and_then(Value::as_str)
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| NervError::Structure(format!("invalid uuid {s:?}: {e}")))
}
