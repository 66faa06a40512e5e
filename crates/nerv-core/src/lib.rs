//! NERV core: transport-agnostic envelope model, structural codec, wire framing,
//! error surface and clock.
//!
//! This crate defines the contracts shared by the relay runtime and by any
//! collaborator that builds envelopes. It intentionally carries no async
//! runtime dependency so it can be reused outside the relay.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here
//! (`#![deny(clippy::panic, clippy::unwrap_used, clippy::expect_used)]`).
//! Malformed input surfaces as `NervError`/`Result`, never as a crash.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod clock;
pub mod error;
pub mod protocol;

/// Shared result type.
pub use error::{NervError, ReasonCode, Result};
