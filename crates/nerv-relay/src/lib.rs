//! NERV relay runtime.
//!
//! Wires config, observability, buffers, correlation, transport, the channel
//! state machine and the hybrid router into the [`Nerv`] facade. The peer
//! endpoint and the `nerv-relay` binary provide the accepting side of the
//! handshake. Consumed by the binary (`main.rs`) and by integration tests.

pub mod buffers;
pub mod channel;
pub mod config;
pub mod context;
pub mod correlation;
pub mod nerv;
pub mod obs;
pub mod outcome;
pub mod peer;
pub mod router;
pub mod transport;

pub use channel::{Channel, ChannelState};
pub use config::{Mode, RelayConfig};
pub use context::NervContext;
pub use nerv::{Nerv, NervStatus};
pub use outcome::SendOutcome;
pub use peer::PeerServer;
pub use router::Router;
