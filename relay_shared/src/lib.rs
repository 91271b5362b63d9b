//! `relay_shared`
//!
//! Shared libraries used by both the relay client and server peers.
//!
//! Design goals:
//! - Protocol components (codec, sessions, broker, replication) are
//!   synchronous transforms over delivered buffers; sockets live at the
//!   edges.
//! - Explicit constructed registries instead of process-wide state: the
//!   method table, type registry, and session manager are values a peer
//!   owns and passes by reference.
//! - Clear separation of concerns (codec, session, rpc, replication,
//!   transport, config).
//! - No `unsafe`.

pub mod codec;
pub mod config;
pub mod pawn;
pub mod registry;
pub mod replication;
pub mod rpc;
pub mod session;
pub mod transport;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::codec::{Schema, Value, WireType};
    pub use crate::config::RelayConfig;
    pub use crate::registry::{EntityId, EntityStore, Replicable, TypeId, TypeRegistry};
    pub use crate::replication::{ApplyReport, ReplicationEngine, Snapshot};
    pub use crate::rpc::{AllowRemote, MethodTable, RpcBroker, RunOn};
    pub use crate::session::{SessionManager, TokenPair};
    pub use crate::transport::{InboundMessage, Lane, PeerId, PeerSender};
}
