//! Protocol modules (envelope model, structural codec, framing, handshake).
//!
//! - `envelope`: immutable canonical envelope + construction-time validation.
//! - `codec`: raw JSON shape, normalization, structural validation.
//! - `frame`: 4-byte big-endian length-prefixed framing.
//! - `handshake`: identity exchange primitives.
//!
//! All parsers are panic-free: malformed input is reported as `NervError`
//! instead of panicking or indexing raw buffers.

pub mod codec;
pub mod envelope;
pub mod frame;
pub mod handshake;

pub use codec::{decode, encode, normalize, validate_structure, RawEnvelope};
pub use envelope::{action, ActionCode, ActorId, Envelope, EnvelopeBuilder, Kind, Payload};
pub use frame::{pack, Unpacker};
pub use handshake::HandshakeDescriptor;

/// Current protocol version carried in `protocol.version`.
pub const PROTOCOL_VERSION: u32 = 2;
