//! `relay_client`
//!
//! Client-side systems:
//! - Connection management (reliable + unreliable channels)
//! - Session installation from the server's handshake
//! - Authenticated call origination and dispatch
//! - Snapshot reconciliation against the local entity store

pub mod client;

pub use client::{ClientState, RelayClient};
