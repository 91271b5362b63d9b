//! Authenticated remote-call broker.
//!
//! Calls travel in [`RpcEnvelope`]s: a per-direction session token, the true
//! originating peer, a target path, a method name, and a double-encoded
//! argument blob (each argument encoded against its declared parameter type,
//! then the byte arrays wrapped in a count-prefixed blob so a receiver can
//! decode from the method signature alone).
//!
//! Topology is a star: a client sends only to the server; the server fans a
//! validated envelope out to every other connected peer, re-addressed with
//! each peer's own token, which gives broadcast semantics over a hub that
//! only supports peer-addressed sends.
//!
//! Who may call what, and where a call runs, is declared once per method in
//! a [`MethodTable`] — an explicit registration table queried by name. A
//! method that was never registered is never callable remotely.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{self, read_bytes, read_str, take, write_bytes, write_str, CodecError, Value, WireType};
use crate::registry::{EntityId, EntityStore};
use crate::session::{SessionError, SessionManager};
use crate::transport::{Lane, PeerId, PeerSender, TransportError};

/// Who may originate a remote call to a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowRemote {
    /// Any connected peer.
    Any,
    /// The server, or the owner of the target entity.
    Master,
    /// The server only.
    Server,
}

/// Where a call executes after validation and relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOn {
    Server,
    Clients,
    Owner,
    /// Server and clients both; ownership still gates nothing extra.
    All,
}

bitflags::bitflags! {
    /// Execution-location mask derived from [`RunOn`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExecMask: u8 {
        const SERVER = 1 << 0;
        const CLIENTS = 1 << 1;
        const OWNER = 1 << 2;
    }
}

impl RunOn {
    pub fn mask(self) -> ExecMask {
        match self {
            RunOn::Server => ExecMask::SERVER,
            RunOn::Clients => ExecMask::CLIENTS,
            RunOn::Owner => ExecMask::OWNER,
            RunOn::All => ExecMask::SERVER | ExecMask::CLIENTS,
        }
    }
}

/// Broker failures. Every variant is per-envelope: the dispatch loop logs
/// and keeps going.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("authentication failure: bad token on envelope from {sender}")]
    Authentication { sender: PeerId },
    #[error("{sender} is not permitted to call {method}")]
    PermissionDenied { sender: PeerId, method: String },
    #[error("unknown target or method: {0}")]
    UnknownTarget(String),
    #[error("method {0} is not registered for remote calls")]
    NotCallableRemotely(String),
    #[error("method {method} takes {expected} arguments, got {found}")]
    Arity {
        method: String,
        expected: usize,
        found: usize,
    },
    #[error("method handler failed: {0}")]
    Handler(anyhow::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Handler invoked when a validated call executes on this peer.
///
/// Handlers receive the whole store plus the resolved target id rather than
/// just the target entity, so a server-side method may also spawn or despawn
/// entities (client-requested spawns ride this path).
pub type MethodHandler =
    Box<dyn FnMut(&mut EntityStore, EntityId, &[Value]) -> anyhow::Result<()> + Send>;

struct MethodDef {
    params: Vec<WireType>,
    allow: AllowRemote,
    run_on: RunOn,
    handler: MethodHandler,
}

/// Per-method registration table: name -> parameter types, permission
/// declaration, execution location, handler. Populated at startup.
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<String, MethodDef>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        params: Vec<WireType>,
        allow: AllowRemote,
        run_on: RunOn,
        handler: MethodHandler,
    ) {
        debug!(method = name, ?allow, ?run_on, "registered rpc method");
        self.methods.insert(
            name.to_string(),
            MethodDef {
                params,
                allow,
                run_on,
                handler,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    fn spec(&self, name: &str) -> Option<(Vec<WireType>, AllowRemote, RunOn)> {
        self.methods
            .get(name)
            .map(|def| (def.params.clone(), def.allow, def.run_on))
    }

    fn call(
        &mut self,
        name: &str,
        store: &mut EntityStore,
        target: EntityId,
        args: &[Value],
    ) -> Result<(), RpcError> {
        let def = self
            .methods
            .get_mut(name)
            .ok_or_else(|| RpcError::UnknownTarget(name.to_string()))?;
        (def.handler)(store, target, args).map_err(RpcError::Handler)
    }
}

/// The authenticated call message.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcEnvelope {
    pub token: u32,
    pub sender: PeerId,
    pub target_path: String,
    pub method: String,
    /// One pre-encoded blob per argument, in declaration order.
    pub args: Vec<Vec<u8>>,
}

impl RpcEnvelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.token);
        buf.put_i32_le(self.sender.0);
        write_str(&mut buf, Some(&self.target_path));
        write_str(&mut buf, Some(&self.method));
        buf.put_i32_le(self.args.len() as i32);
        for arg in &self.args {
            write_bytes(&mut buf, arg);
        }
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<RpcEnvelope, CodecError> {
        let mut input = bytes;
        let token = take(&mut input, 4)?.get_u32_le();
        let sender = PeerId(take(&mut input, 4)?.get_i32_le());
        let target_path = read_str(&mut input)?.ok_or(CodecError::Mismatch {
            expected: "string",
            found: "null",
        })?;
        let method = read_str(&mut input)?.ok_or(CodecError::Mismatch {
            expected: "string",
            found: "null",
        })?;
        let count = take(&mut input, 4)?.get_i32_le();
        if count < 0 {
            return Err(CodecError::InvalidCount(count));
        }
        let mut args = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            args.push(read_bytes(&mut input)?);
        }
        if !input.is_empty() {
            return Err(CodecError::TrailingBytes {
                remaining: input.len(),
            });
        }
        Ok(RpcEnvelope {
            token,
            sender,
            target_path,
            method,
            args,
        })
    }
}

/// Renders the wire path addressing an entity.
pub fn entity_path(id: EntityId) -> String {
    format!("entities/{}", id.0)
}

/// Resolves a wire path back to an entity id.
pub fn parse_entity_path(path: &str) -> Option<EntityId> {
    path.strip_prefix("entities/")
        .and_then(|raw| raw.parse::<i32>().ok())
        .map(EntityId)
}

/// Validates, relays, and executes authenticated calls for one peer.
pub struct RpcBroker {
    local_peer: PeerId,
    server_peer: PeerId,
    methods: MethodTable,
}

impl RpcBroker {
    pub fn new(local_peer: PeerId, server_peer: PeerId, methods: MethodTable) -> Self {
        Self {
            local_peer,
            server_peer,
            methods,
        }
    }

    fn is_server(&self) -> bool {
        self.local_peer == self.server_peer
    }

    /// Whether a call with this execution mask runs on this peer, given the
    /// target entity's owner.
    fn runs_here(&self, mask: ExecMask, owner: PeerId) -> bool {
        (self.is_server() && mask.contains(ExecMask::SERVER))
            || (!self.is_server() && mask.contains(ExecMask::CLIENTS))
            || (owner == self.local_peer && mask.contains(ExecMask::OWNER))
    }

    /// Originates a call from local application code.
    ///
    /// Encodes the arguments against the method's declared parameter types,
    /// ships envelopes (server: one per connected peer bearing that peer's
    /// token; client: exactly one to the server), and runs the method
    /// in-process immediately when the execution mask selects this peer —
    /// no round trip for self-addressed work.
    pub fn invoke(
        &mut self,
        sessions: &SessionManager,
        store: &mut EntityStore,
        out: &mut dyn PeerSender,
        target: EntityId,
        method: &str,
        args: &[Value],
    ) -> Result<(), RpcError> {
        let (params, _allow, run_on) = self
            .methods
            .spec(method)
            .ok_or_else(|| RpcError::NotCallableRemotely(method.to_string()))?;
        if args.len() != params.len() {
            return Err(RpcError::Arity {
                method: method.to_string(),
                expected: params.len(),
                found: args.len(),
            });
        }

        let mut encoded_args = Vec::with_capacity(args.len());
        for (value, ty) in args.iter().zip(&params) {
            encoded_args.push(codec::encode(value, ty)?);
        }

        let path = entity_path(target);
        if self.is_server() {
            for peer in out.peers() {
                let Some(pair) = sessions.tokens(peer) else {
                    warn!(%peer, method, "skipping fan-out target with no session");
                    continue;
                };
                let envelope = RpcEnvelope {
                    token: pair.server_token,
                    sender: self.local_peer,
                    target_path: path.clone(),
                    method: method.to_string(),
                    args: encoded_args.clone(),
                };
                out.send(peer, Lane::Rpc, &envelope.encode())?;
            }
        } else {
            let pair = sessions
                .tokens(self.local_peer)
                .ok_or(SessionError::Unknown(self.local_peer))?;
            let envelope = RpcEnvelope {
                token: pair.client_token,
                sender: self.local_peer,
                target_path: path,
                method: method.to_string(),
                args: encoded_args,
            };
            out.send(self.server_peer, Lane::Rpc, &envelope.encode())?;
        }

        let owner = store.get(target).map(|e| e.owner());
        if let Some(owner) = owner {
            if self.runs_here(run_on.mask(), owner) {
                self.methods.call(method, store, target, args)?;
            }
        }
        Ok(())
    }

    /// Handles one inbound envelope.
    ///
    /// Validation order matters: token first (nothing unauthenticated gets
    /// further), then target/method resolution, then the allowed-sender
    /// check, then (server only) fan-out to every peer but the originator,
    /// and finally local execution when the mask selects this role.
    pub fn receive(
        &mut self,
        sessions: &SessionManager,
        store: &mut EntityStore,
        out: &mut dyn PeerSender,
        payload: &[u8],
    ) -> Result<(), RpcError> {
        let envelope = RpcEnvelope::decode(payload)?;

        let authentic = if self.is_server() {
            sessions.validate_from_client(envelope.sender, envelope.token)
        } else {
            sessions.validate_from_server(self.local_peer, envelope.token)
        };
        if !authentic {
            return Err(RpcError::Authentication {
                sender: envelope.sender,
            });
        }

        let target = parse_entity_path(&envelope.target_path)
            .ok_or_else(|| RpcError::UnknownTarget(envelope.target_path.clone()))?;
        let owner = store
            .get(target)
            .map(|e| e.owner())
            .ok_or_else(|| RpcError::UnknownTarget(envelope.target_path.clone()))?;
        let (params, allow, run_on) = self
            .methods
            .spec(&envelope.method)
            .ok_or_else(|| RpcError::UnknownTarget(envelope.method.clone()))?;

        let sender_allowed = match allow {
            AllowRemote::Any => true,
            AllowRemote::Server => envelope.sender == self.server_peer,
            AllowRemote::Master => {
                envelope.sender == self.server_peer || envelope.sender == owner
            }
        };
        if !sender_allowed {
            return Err(RpcError::PermissionDenied {
                sender: envelope.sender,
                method: envelope.method,
            });
        }

        if self.is_server() {
            for peer in out.peers() {
                if peer == envelope.sender {
                    continue;
                }
                let Some(pair) = sessions.tokens(peer) else {
                    warn!(%peer, method = %envelope.method, "skipping relay target with no session");
                    continue;
                };
                let relayed = RpcEnvelope {
                    token: pair.server_token,
                    sender: envelope.sender,
                    target_path: envelope.target_path.clone(),
                    method: envelope.method.clone(),
                    args: envelope.args.clone(),
                };
                out.send(peer, Lane::Rpc, &relayed.encode())?;
            }
        }

        if self.runs_here(run_on.mask(), owner) {
            if envelope.args.len() != params.len() {
                return Err(RpcError::Arity {
                    method: envelope.method,
                    expected: params.len(),
                    found: envelope.args.len(),
                });
            }
            let mut values = Vec::with_capacity(envelope.args.len());
            for (bytes, ty) in envelope.args.iter().zip(&params) {
                values.push(codec::decode(bytes, ty)?);
            }
            debug!(method = %envelope.method, sender = %envelope.sender, %target, "executing rpc");
            self.methods.call(&envelope.method, store, target, &values)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::registry::test_support::Marker;
    use crate::session::TokenPair;
    use crate::transport::test_support::RecordingSender;

    const SERVER: PeerId = PeerId(1);
    const OWNER: PeerId = PeerId(2);
    const OTHER: PeerId = PeerId(3);

    fn counting_table(allow: AllowRemote, run_on: RunOn, hits: Arc<AtomicI32>) -> MethodTable {
        let mut methods = MethodTable::new();
        methods.register(
            "poke",
            vec![WireType::I32],
            allow,
            run_on,
            Box::new(move |store, target, args| {
                hits.fetch_add(1, Ordering::SeqCst);
                if let (Some(entity), Some(v)) = (store.get_mut(target), args[0].as_i32()) {
                    entity.apply_replicated_fields(&[Value::Str(None), Value::I32(v)])?;
                }
                Ok(())
            }),
        );
        methods
    }

    /// Server-side fixture: sessions for OWNER and OTHER, one entity owned
    /// by OWNER.
    fn server_fixture(
        allow: AllowRemote,
        run_on: RunOn,
        hits: Arc<AtomicI32>,
    ) -> (RpcBroker, SessionManager, EntityStore, EntityId) {
        let broker = RpcBroker::new(SERVER, SERVER, counting_table(allow, run_on, hits));
        let mut sessions = SessionManager::new();
        sessions.open(OWNER).unwrap();
        sessions.open(OTHER).unwrap();
        let mut store = EntityStore::new();
        let target = store.spawn(Box::<Marker>::default(), OWNER);
        (broker, sessions, store, target)
    }

    fn envelope_from(
        sessions: &SessionManager,
        sender: PeerId,
        target: EntityId,
        args: Vec<Vec<u8>>,
    ) -> RpcEnvelope {
        let token = sessions.tokens(sender).unwrap().client_token;
        RpcEnvelope {
            token,
            sender,
            target_path: entity_path(target),
            method: "poke".to_string(),
            args,
        }
    }

    fn encoded_i32(v: i32) -> Vec<u8> {
        codec::encode(&Value::I32(v), &WireType::I32).unwrap()
    }

    #[test]
    fn envelope_roundtrips() {
        let envelope = RpcEnvelope {
            token: 0xCAFE_F00D,
            sender: PeerId(3),
            target_path: "entities/9".to_string(),
            method: "poke".to_string(),
            args: vec![encoded_i32(5), vec![]],
        };
        let bytes = envelope.encode();
        assert_eq!(RpcEnvelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn envelope_rejects_truncation_and_trailing() {
        let envelope = RpcEnvelope {
            token: 1,
            sender: PeerId(2),
            target_path: "entities/1".to_string(),
            method: "poke".to_string(),
            args: vec![],
        };
        let mut bytes = envelope.encode();
        assert!(RpcEnvelope::decode(&bytes[..bytes.len() - 1]).is_err());
        bytes.push(0);
        assert!(matches!(
            RpcEnvelope::decode(&bytes),
            Err(CodecError::TrailingBytes { .. })
        ));
    }

    #[test]
    fn entity_paths_resolve() {
        assert_eq!(parse_entity_path(&entity_path(EntityId(41))), Some(EntityId(41)));
        assert_eq!(parse_entity_path("entities/zzz"), None);
        assert_eq!(parse_entity_path("players/3"), None);
    }

    #[test]
    fn wrong_token_is_rejected_and_never_relayed() {
        let hits = Arc::new(AtomicI32::new(0));
        let (mut broker, sessions, mut store, target) =
            server_fixture(AllowRemote::Any, RunOn::All, hits.clone());
        let mut out = RecordingSender::new(vec![OWNER, OTHER]);

        let mut envelope = envelope_from(&sessions, OWNER, target, vec![encoded_i32(1)]);
        envelope.token = envelope.token.wrapping_add(1);

        let err = broker
            .receive(&sessions, &mut store, &mut out, &envelope.encode())
            .unwrap_err();
        assert!(matches!(err, RpcError::Authentication { sender: OWNER }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(out.sent.is_empty(), "rejected envelope must not fan out");
    }

    #[test]
    fn anothers_token_does_not_authenticate() {
        let hits = Arc::new(AtomicI32::new(0));
        let (mut broker, sessions, mut store, target) =
            server_fixture(AllowRemote::Any, RunOn::All, hits.clone());
        let mut out = RecordingSender::new(vec![OWNER, OTHER]);

        // OTHER's valid token on an envelope claiming to be OWNER.
        let mut envelope = envelope_from(&sessions, OWNER, target, vec![encoded_i32(1)]);
        envelope.token = sessions.tokens(OTHER).unwrap().client_token;

        assert!(matches!(
            broker.receive(&sessions, &mut store, &mut out, &envelope.encode()),
            Err(RpcError::Authentication { .. })
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(out.sent.is_empty());
    }

    #[test]
    fn evicted_session_tokens_stop_working() {
        let hits = Arc::new(AtomicI32::new(0));
        let (mut broker, mut sessions, mut store, target) =
            server_fixture(AllowRemote::Any, RunOn::All, hits.clone());
        let mut out = RecordingSender::new(vec![OTHER]);

        let envelope = envelope_from(&sessions, OWNER, target, vec![encoded_i32(1)]);
        sessions.close(OWNER);

        assert!(matches!(
            broker.receive(&sessions, &mut store, &mut out, &envelope.encode()),
            Err(RpcError::Authentication { .. })
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn permission_matrix_gates_senders_exactly() {
        let allows = [AllowRemote::Any, AllowRemote::Master, AllowRemote::Server];
        let runs = [RunOn::Server, RunOn::Clients, RunOn::Owner, RunOn::All];
        let senders = [SERVER, OWNER, OTHER];

        for allow in allows {
            for run_on in runs {
                for sender in senders {
                    let hits = Arc::new(AtomicI32::new(0));
                    let (mut broker, sessions, mut store, target) =
                        server_fixture(allow, run_on, hits.clone());
                    let mut out = RecordingSender::new(vec![OWNER, OTHER]);

                    // The server never addresses envelopes to itself, so the
                    // matrix is exercised through client senders; SERVER as a
                    // claimed sender must always fail authentication (it has
                    // no client session).
                    let envelope = if sender == SERVER {
                        let mut e =
                            envelope_from(&sessions, OWNER, target, vec![encoded_i32(1)]);
                        e.sender = SERVER;
                        e
                    } else {
                        envelope_from(&sessions, sender, target, vec![encoded_i32(1)])
                    };

                    let result =
                        broker.receive(&sessions, &mut store, &mut out, &envelope.encode());

                    let expect_accept = match (sender, allow) {
                        (s, _) if s == SERVER => false, // no client session
                        (_, AllowRemote::Any) => true,
                        (s, AllowRemote::Master) => s == OWNER,
                        (_, AllowRemote::Server) => false,
                    };
                    assert_eq!(
                        result.is_ok(),
                        expect_accept,
                        "allow={allow:?} run_on={run_on:?} sender={sender}"
                    );

                    // Execution on the server happens iff the call was
                    // accepted and the mask selects the server role.
                    let expect_exec = expect_accept
                        && matches!(run_on, RunOn::Server | RunOn::All);
                    assert_eq!(
                        hits.load(Ordering::SeqCst) == 1,
                        expect_exec,
                        "exec: allow={allow:?} run_on={run_on:?} sender={sender}"
                    );
                }
            }
        }
    }

    #[test]
    fn server_fans_out_to_everyone_but_the_originator() {
        let hits = Arc::new(AtomicI32::new(0));
        let (mut broker, mut sessions, mut store, target) =
            server_fixture(AllowRemote::Any, RunOn::Clients, hits.clone());
        sessions.open(PeerId(4)).unwrap();
        let mut out = RecordingSender::new(vec![OWNER, OTHER, PeerId(4)]);

        let envelope = envelope_from(&sessions, OWNER, target, vec![encoded_i32(7)]);
        broker
            .receive(&sessions, &mut store, &mut out, &envelope.encode())
            .unwrap();

        let recipients: Vec<PeerId> = out.sent.iter().map(|(p, _, _)| *p).collect();
        assert_eq!(recipients, vec![OTHER, PeerId(4)]);

        for (peer, lane, payload) in &out.sent {
            assert_eq!(*lane, Lane::Rpc);
            let relayed = RpcEnvelope::decode(payload).unwrap();
            assert_eq!(relayed.sender, OWNER, "true originator is preserved");
            assert_eq!(relayed.method, "poke");
            assert_eq!(
                relayed.token,
                sessions.tokens(*peer).unwrap().server_token,
                "relay is re-addressed with the recipient's server token"
            );
        }
        // RunOnClients: the server itself does not execute.
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn client_invoke_sends_one_envelope_to_the_server() {
        let hits = Arc::new(AtomicI32::new(0));
        let mut broker = RpcBroker::new(
            OWNER,
            SERVER,
            counting_table(AllowRemote::Master, RunOn::Server, hits.clone()),
        );
        let mut sessions = SessionManager::new();
        let pair = TokenPair {
            server_token: 11,
            client_token: 22,
        };
        sessions.install(OWNER, pair).unwrap();
        let mut store = EntityStore::new();
        let target = store.spawn(Box::<Marker>::default(), OWNER);
        let mut out = RecordingSender::new(vec![]);

        broker
            .invoke(
                &sessions,
                &mut store,
                &mut out,
                target,
                "poke",
                &[Value::I32(3)],
            )
            .unwrap();

        assert_eq!(out.sent.len(), 1);
        let (peer, lane, payload) = &out.sent[0];
        assert_eq!(*peer, SERVER);
        assert_eq!(*lane, Lane::Rpc);
        let envelope = RpcEnvelope::decode(payload).unwrap();
        assert_eq!(envelope.token, 22, "client authenticates with its client token");
        assert_eq!(envelope.sender, OWNER);
        // RunOnServer: no local echo on the client.
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn owner_invoke_runs_locally_for_run_on_owner() {
        let hits = Arc::new(AtomicI32::new(0));
        let mut broker = RpcBroker::new(
            OWNER,
            SERVER,
            counting_table(AllowRemote::Master, RunOn::Owner, hits.clone()),
        );
        let mut sessions = SessionManager::new();
        sessions
            .install(
                OWNER,
                TokenPair {
                    server_token: 1,
                    client_token: 2,
                },
            )
            .unwrap();
        let mut store = EntityStore::new();
        let target = store.spawn(Box::<Marker>::default(), OWNER);
        let mut out = RecordingSender::new(vec![]);

        broker
            .invoke(
                &sessions,
                &mut store,
                &mut out,
                target,
                "poke",
                &[Value::I32(3)],
            )
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1, "owner executes immediately");
        assert_eq!(out.sent.len(), 1, "and the envelope still goes out");
    }

    #[test]
    fn unregistered_method_never_leaves_the_process() {
        let hits = Arc::new(AtomicI32::new(0));
        let (mut broker, sessions, mut store, target) =
            server_fixture(AllowRemote::Any, RunOn::All, hits);
        let mut out = RecordingSender::new(vec![OWNER]);

        let err = broker
            .invoke(&sessions, &mut store, &mut out, target, "vanish", &[])
            .unwrap_err();
        assert!(matches!(err, RpcError::NotCallableRemotely(_)));
        assert!(out.sent.is_empty());
    }

    #[test]
    fn unknown_method_and_target_are_rejected_on_receipt() {
        let hits = Arc::new(AtomicI32::new(0));
        let (mut broker, sessions, mut store, target) =
            server_fixture(AllowRemote::Any, RunOn::All, hits);
        let mut out = RecordingSender::new(vec![OWNER, OTHER]);

        let mut envelope = envelope_from(&sessions, OWNER, target, vec![encoded_i32(1)]);
        envelope.method = "vanish".to_string();
        assert!(matches!(
            broker.receive(&sessions, &mut store, &mut out, &envelope.encode()),
            Err(RpcError::UnknownTarget(_))
        ));

        let mut envelope = envelope_from(&sessions, OWNER, target, vec![encoded_i32(1)]);
        envelope.target_path = "entities/99".to_string();
        assert!(matches!(
            broker.receive(&sessions, &mut store, &mut out, &envelope.encode()),
            Err(RpcError::UnknownTarget(_))
        ));
        assert!(out.sent.is_empty());
    }

    #[test]
    fn handler_failure_is_contained() {
        let mut methods = MethodTable::new();
        methods.register(
            "explode",
            vec![],
            AllowRemote::Any,
            RunOn::All,
            Box::new(|_, _, _| anyhow::bail!("boom")),
        );
        let mut broker = RpcBroker::new(SERVER, SERVER, methods);
        let mut sessions = SessionManager::new();
        sessions.open(OWNER).unwrap();
        let mut store = EntityStore::new();
        let target = store.spawn(Box::<Marker>::default(), OWNER);
        let mut out = RecordingSender::new(vec![OWNER]);

        let envelope = RpcEnvelope {
            token: sessions.tokens(OWNER).unwrap().client_token,
            sender: OWNER,
            target_path: entity_path(target),
            method: "explode".to_string(),
            args: vec![],
        };
        let err = broker
            .receive(&sessions, &mut store, &mut out, &envelope.encode())
            .unwrap_err();
        assert!(matches!(err, RpcError::Handler(_)));

        // The broker stays usable after a handler failure.
        assert!(matches!(
            broker.receive(&sessions, &mut store, &mut out, &envelope.encode()),
            Err(RpcError::Handler(_))
        ));
    }

    #[test]
    fn argument_shape_violations_are_codec_errors() {
        let hits = Arc::new(AtomicI32::new(0));
        let (mut broker, sessions, mut store, target) =
            server_fixture(AllowRemote::Any, RunOn::All, hits.clone());
        let mut out = RecordingSender::new(vec![]);

        // Wrong arity.
        let envelope = envelope_from(&sessions, OWNER, target, vec![]);
        assert!(matches!(
            broker.receive(&sessions, &mut store, &mut out, &envelope.encode()),
            Err(RpcError::Arity { .. })
        ));

        // Truncated argument bytes.
        let envelope = envelope_from(&sessions, OWNER, target, vec![vec![1, 2]]);
        assert!(matches!(
            broker.receive(&sessions, &mut store, &mut out, &envelope.encode()),
            Err(RpcError::Codec(_))
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn client_validates_the_server_token_and_runs_client_masked_calls() {
        let hits = Arc::new(AtomicI32::new(0));
        let mut broker = RpcBroker::new(
            OWNER,
            SERVER,
            counting_table(AllowRemote::Server, RunOn::Clients, hits.clone()),
        );
        let mut sessions = SessionManager::new();
        sessions
            .install(
                OWNER,
                TokenPair {
                    server_token: 77,
                    client_token: 88,
                },
            )
            .unwrap();
        let mut store = EntityStore::new();
        let target = store.spawn(Box::<Marker>::default(), OWNER);
        let mut out = RecordingSender::new(vec![]);

        let envelope = RpcEnvelope {
            token: 77,
            sender: SERVER,
            target_path: entity_path(target),
            method: "poke".to_string(),
            args: vec![encoded_i32(4)],
        };
        broker
            .receive(&sessions, &mut store, &mut out, &envelope.encode())
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(out.sent.is_empty(), "clients never relay");

        // The client token does not authenticate the server direction.
        let mut wrong = envelope;
        wrong.token = 88;
        assert!(matches!(
            broker.receive(&sessions, &mut store, &mut out, &wrong.encode()),
            Err(RpcError::Authentication { .. })
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_may_spawn_entities() {
        // A client-requested spawn: the owner calls a server method whose
        // handler creates a new entity, owned by the same peer.
        let mut methods = MethodTable::new();
        methods.register(
            "split",
            vec![],
            AllowRemote::Master,
            RunOn::Server,
            Box::new(|store, target, _args| {
                let owner = store
                    .get(target)
                    .map(|e| e.owner())
                    .ok_or_else(|| anyhow::anyhow!("target missing"))?;
                store.spawn(Box::<Marker>::default(), owner);
                Ok(())
            }),
        );
        let mut broker = RpcBroker::new(SERVER, SERVER, methods);
        let mut sessions = SessionManager::new();
        sessions.open(OWNER).unwrap();
        let mut store = EntityStore::new();
        let target = store.spawn(Box::<Marker>::default(), OWNER);
        let mut out = RecordingSender::new(vec![OWNER]);

        let envelope = RpcEnvelope {
            token: sessions.tokens(OWNER).unwrap().client_token,
            sender: OWNER,
            target_path: entity_path(target),
            method: "split".to_string(),
            args: vec![],
        };
        broker
            .receive(&sessions, &mut store, &mut out, &envelope.encode())
            .unwrap();

        assert_eq!(store.len(), 2);
        let spawned = store.ids()[1];
        assert_eq!(store.get(spawned).unwrap().owner(), OWNER);
    }

    #[test]
    fn executed_call_mutates_the_target_entity() {
        let hits = Arc::new(AtomicI32::new(0));
        let (mut broker, sessions, mut store, target) =
            server_fixture(AllowRemote::Master, RunOn::Server, hits.clone());
        let mut out = RecordingSender::new(vec![OWNER]);

        let envelope = envelope_from(&sessions, OWNER, target, vec![encoded_i32(41)]);
        broker
            .receive(&sessions, &mut store, &mut out, &envelope.encode())
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let fields = store.get(target).unwrap().replicated_fields();
        assert_eq!(fields[1], Value::I32(41));
    }
}
