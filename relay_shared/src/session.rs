//! Session token management.
//!
//! Every connected peer is mutually authenticated with the server through a
//! pair of independently random 32-bit tokens, dealt by the server when the
//! peer connects and delivered over a dedicated handshake message before any
//! other traffic from that peer is accepted as authentic:
//!
//! - `server_token` authenticates the server when it addresses this peer.
//! - `client_token` authenticates this peer when it addresses the server.
//!
//! The server holds one pair per connected peer; a client holds exactly one
//! pair (its own, keyed by its own peer id). A pair never changes while the
//! peer stays connected, and disconnect evicts it — calls bearing evicted
//! tokens are rejected from then on.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use thiserror::Error;

use crate::codec::{take, CodecError};
use crate::transport::PeerId;

/// The two per-direction secrets for one connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPair {
    pub server_token: u32,
    pub client_token: u32,
}

impl TokenPair {
    /// Wire form of the handshake payload: both tokens, little-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32_le(self.server_token);
        buf.put_u32_le(self.client_token);
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<TokenPair, CodecError> {
        let mut input = bytes;
        let mut raw = take(&mut input, 8)?;
        let pair = TokenPair {
            server_token: raw.get_u32_le(),
            client_token: raw.get_u32_le(),
        };
        if !input.is_empty() {
            return Err(CodecError::TrailingBytes {
                remaining: input.len(),
            });
        }
        Ok(pair)
    }
}

/// Session lifecycle failures.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A second connect/handshake arrived for a peer that already has a
    /// live session. The existing pair is kept; the duplicate is dropped.
    #[error("{0} already has a session")]
    AlreadyConnected(PeerId),
    #[error("no session for {0}")]
    Unknown(PeerId),
}

/// Tracks the token pair for every live peer session.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: BTreeMap<PeerId, TokenPair>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server side: mints a fresh random pair for a newly connected peer.
    ///
    /// A duplicate open for a known peer is rejected without touching the
    /// existing pair — a connected peer's tokens never change.
    pub fn open(&mut self, peer: PeerId) -> Result<TokenPair, SessionError> {
        if self.sessions.contains_key(&peer) {
            return Err(SessionError::AlreadyConnected(peer));
        }
        let mut rng = rand::thread_rng();
        let pair = TokenPair {
            server_token: rng.gen(),
            client_token: rng.gen(),
        };
        self.sessions.insert(peer, pair);
        Ok(pair)
    }

    /// Client side: stores the pair received in the server's handshake.
    ///
    /// Same invariant as [`open`](Self::open): a second handshake for a
    /// peer that already holds a pair is rejected, not applied.
    pub fn install(&mut self, peer: PeerId, pair: TokenPair) -> Result<(), SessionError> {
        if self.sessions.contains_key(&peer) {
            return Err(SessionError::AlreadyConnected(peer));
        }
        self.sessions.insert(peer, pair);
        Ok(())
    }

    /// Evicts the session on disconnect. Returns whether one existed.
    pub fn close(&mut self, peer: PeerId) -> bool {
        self.sessions.remove(&peer).is_some()
    }

    pub fn tokens(&self, peer: PeerId) -> Option<TokenPair> {
        self.sessions.get(&peer).copied()
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.sessions.contains_key(&peer)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Server side: does `token` authenticate traffic claimed to come from
    /// `peer`?
    pub fn validate_from_client(&self, peer: PeerId, token: u32) -> bool {
        self.tokens(peer)
            .map(|pair| pair.client_token == token)
            .unwrap_or(false)
    }

    /// Client side: does `token` authenticate traffic from the server,
    /// given this peer's own id?
    pub fn validate_from_server(&self, own_peer: PeerId, token: u32) -> bool {
        self.tokens(own_peer)
            .map(|pair| pair.server_token == token)
            .unwrap_or(false)
    }
}
