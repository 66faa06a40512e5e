//! Handshake protocol primitives.
//!
//! The initiator sends `COMMAND/HANDSHAKE` carrying a [`HandshakeDescriptor`];
//! the only acceptable reply is `ACK/HANDSHAKE`.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::envelope::{action, ActorId, Envelope, Kind, Payload};
use crate::protocol::PROTOCOL_VERSION;

/// Identity descriptor carried in the handshake payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeDescriptor {
    pub agent_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub protocol_version: u32,
}

impl HandshakeDescriptor {
    pub fn new(agent_id: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Build the `COMMAND/HANDSHAKE` envelope.
pub fn handshake_command(
    source: &ActorId,
    target: &ActorId,
    descriptor: &HandshakeDescriptor,
) -> Result<Envelope> {
    Envelope::builder(source, target, Kind::Command, action::HANDSHAKE)
        .payload(Payload::from_json(descriptor)?)
        .build()
}

impl Envelope {
    /// Same as [`handshake_command`].
    pub fn handshake(
        source: &ActorId,
        target: &ActorId,
        descriptor: &HandshakeDescriptor,
    ) -> Result<Envelope> {
        handshake_command(source, target, descriptor)
    }
}

/// Is this the opening `COMMAND/HANDSHAKE`?
pub fn is_handshake_command(env: &Envelope) -> bool {
    env.kind() == Kind::Command && env.action() == action::HANDSHAKE
}

/// Is this an acceptable reply to a handshake?
pub fn is_handshake_ack(env: &Envelope) -> bool {
    env.kind() == Kind::Ack && env.action() == action::HANDSHAKE
}
