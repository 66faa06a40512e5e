//! Envelope codec vector tests.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use nerv_core::protocol::codec::{self, RawEnvelope};
use nerv_core::protocol::envelope::{ActorId, Kind};
use nerv_core::protocol::PROTOCOL_VERSION;
use nerv_core::ReasonCode;

use vector_loader::StructuralCase;

#[test]
fn decode_full_envelope() {
    let s = vector_loader::load_raw("envelope_full.json");
    let env = codec::decode(s.as_bytes(), 0).unwrap();

    assert_eq!(env.protocol().version, 2);
    assert_eq!(env.protocol().timestamp, 1_737_331_200_000);
    assert_eq!(env.source(), &ActorId::Maestro);
    assert_eq!(env.target(), &ActorId::Driver);
    assert_eq!(env.kind(), Kind::Command);
    assert_eq!(env.action(), "DRIVER_EXECUTE_TASK");
    assert!(!env.starts_chain());
    // payload bytes are carried untouched, including the odd spacing
    assert_eq!(env.payload().get(), r#"{ "taskId": "t-42",  "prompt": "hello" }"#);
}

#[test]
fn decode_minimal_envelope_fills_protocol_defaults() {
    let s = vector_loader::load_raw("envelope_min.json");
    let env = codec::decode(s.as_bytes(), 42).unwrap();

    assert_eq!(env.protocol().version, PROTOCOL_VERSION);
    assert_eq!(env.protocol().timestamp, 42);
    assert_eq!(env.source().as_str(), "agent:gpt-01");
    assert!(env.source().is_extension());
    assert!(env.starts_chain());
    assert!(env.payload().is_empty_object());
}

#[test]
fn integral_float_version_is_accepted() {
    let s = vector_loader::load_raw("envelope_full.json").replacen(r#""version": 2,"#, r#""version": 2.0,"#, 1);
    assert!(s.contains("2.0"));
    let env = codec::decode(s.as_bytes(), 0).unwrap();
    assert_eq!(env.protocol().version, PROTOCOL_VERSION);
}

#[test]
fn legacy_shape_is_rejected() {
    let s = vector_loader::load_raw("envelope_legacy.json");
    let err = codec::decode(s.as_bytes(), 0).expect_err("legacy shape must fail");
    assert_eq!(err.reason_code(), ReasonCode::StructureInvalid);
}

#[test]
fn structural_cases_report_reasons() {
    let cases: Vec<StructuralCase> = vector_loader::load("envelope_structural_cases.json");
    assert!(!cases.is_empty());

    for c in cases {
        let raw: RawEnvelope = serde_json::from_value(c.envelope).unwrap();
        let raw = codec::normalize(raw, 1);
        let reason = codec::validate_structure(&raw).expect_err(&c.description);
        assert!(
            reason.contains(&c.reason_contains),
            "case={} reason={reason}",
            c.description
        );
    }
}

#[test]
fn normalize_never_invents_identity_or_causality() {
    let raw = codec::normalize(RawEnvelope::default(), 7);
    assert!(raw.protocol.is_some());
    assert!(raw.identity.is_none());
    assert!(raw.causality.is_none());
    assert_eq!(
        codec::validate_structure(&raw).unwrap_err(),
        "identity block is required"
    );
}

#[test]
fn unrecognized_actor_is_a_structural_error() {
    let s = vector_loader::load_raw("envelope_full.json").replace("\"MAESTRO\"", "\"NOBODY\"");
    let err = codec::decode(s.as_bytes(), 0).unwrap_err();
    assert_eq!(err.reason_code(), ReasonCode::StructureInvalid);
}

#[test]
fn encode_then_decode_preserves_envelope() {
    let s = vector_loader::load_raw("envelope_full.json");
    let env = codec::decode(s.as_bytes(), 0).unwrap();
    let bytes = codec::encode(&env).unwrap();
    let back = codec::decode(&bytes, 0).unwrap();
    assert_eq!(env, back);
}
