//! `relay_server`
//!
//! Server-side systems:
//! - Connection hub assigning peer ids and dealing session tokens
//! - Fixed timestep loop draining socket events into the broker
//! - Call fan-out to all connected peers
//! - Snapshot broadcast on the unreliable plane
//! - Idle self-termination policy
//!
//! Networking model:
//! - TCP: preamble, handshake, and call envelopes (ordered, reliable)
//! - UDP: snapshots (unordered, loss-tolerant)

pub mod server;

pub use server::RelayServer;
