//! Top-level facade crate for NERV.
//!
//! Re-exports the core protocol types and the relay runtime so users can depend on a single crate.

pub mod core {
    pub use nerv_core::*;
}

pub mod relay {
    pub use nerv_relay::*;
}

pub use nerv_core::protocol::{ActorId, Envelope, Kind};
pub use nerv_relay::{Nerv, RelayConfig, SendOutcome};
