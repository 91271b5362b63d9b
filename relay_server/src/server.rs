//! Server implementation.
//!
//! The authoritative peer for a relay session. It owns:
//! - the connection hub (TCP control/call plane, UDP snapshot plane),
//! - the session manager that deals per-peer token pairs,
//! - the RPC broker that validates, fans out, and executes calls,
//! - the replication engine that broadcasts entity snapshots on a fixed
//!   interval.
//!
//! Concurrency model: socket I/O runs on per-connection reader/writer
//! tasks, but everything they learn is funneled through one event queue
//! drained by [`RelayServer::step`], so the protocol components run
//! strictly serialized on the tick loop and need no locking.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use relay_shared::{
    codec::Value,
    config::RelayConfig,
    registry::{EntityId, EntityStore, TypeId, TypeRegistry},
    replication::ReplicationEngine,
    rpc::{MethodTable, RpcBroker, RpcError},
    session::SessionManager,
    transport::{
        read_frame, write_frame, Frame, InboundMessage, Lane, PeerId, PeerSender, ReliableConn,
        ReliableListener, TransportError, PROTOCOL_VERSION,
    },
};
use tokio::{net::UdpSocket, sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

/// What the socket tasks report into the tick loop.
enum PeerEvent {
    Inbound(InboundMessage),
    Disconnected(PeerId),
}

/// Hub-side state for one connected peer.
struct PeerState {
    reliable_tx: mpsc::UnboundedSender<Frame>,
    udp_addr: SocketAddr,
}

/// The hub's outbound half, borrowed per dispatch so the broker and engine
/// can send without owning the connection table.
struct HubSender<'a> {
    peers: &'a BTreeMap<PeerId, PeerState>,
    udp: &'a UdpSocket,
}

impl PeerSender for HubSender<'_> {
    fn send(&mut self, peer: PeerId, lane: Lane, payload: &[u8]) -> Result<(), TransportError> {
        let state = self.peers.get(&peer).ok_or(TransportError::ChannelClosed)?;
        let frame = Frame::call(lane, payload.to_vec());
        if lane.is_reliable() {
            state
                .reliable_tx
                .send(frame)
                .map_err(|_| TransportError::ChannelClosed)
        } else {
            // Fire and forget: a dropped datagram is superseded by the next.
            if let Err(err) = self.udp.try_send_to(&frame.encode(), state.udp_addr) {
                debug!(%peer, error = %err, "datagram not sent");
            }
            Ok(())
        }
    }

    fn peers(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }
}

/// Authoritative relay server.
pub struct RelayServer {
    pub cfg: RelayConfig,
    sessions: SessionManager,
    broker: RpcBroker,
    store: EntityStore,
    registry: TypeRegistry,
    engine: ReplicationEngine,

    peers: BTreeMap<PeerId, PeerState>,
    tcp: ReliableListener,
    udp: UdpSocket,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    next_peer_id: i32,

    /// How long the server has run with zero clients connected.
    idle: Duration,
    /// Type spawned (owned by the new peer) on every connect, if set.
    spawn_type: Option<TypeId>,
}

impl RelayServer {
    /// Binds sockets and assembles a server from its collaborators.
    pub async fn new(
        cfg: RelayConfig,
        registry: TypeRegistry,
        methods: MethodTable,
    ) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let tcp = ReliableListener::bind(addr).await?;
        let udp = UdpSocket::bind(addr).await.context("udp bind")?;
        Ok(Self::assemble(cfg, tcp, udp, registry, methods))
    }

    fn assemble(
        cfg: RelayConfig,
        tcp: ReliableListener,
        udp: UdpSocket,
        registry: TypeRegistry,
        methods: MethodTable,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let server_peer = cfg.server_peer();
        let engine = ReplicationEngine::new(cfg.snapshot_interval());
        let next_peer_id = cfg.server_peer_id + 1;
        Self {
            broker: RpcBroker::new(server_peer, server_peer, methods),
            sessions: SessionManager::new(),
            store: EntityStore::new(),
            registry,
            engine,
            peers: BTreeMap::new(),
            tcp,
            udp,
            events_tx,
            events_rx,
            next_peer_id,
            idle: Duration::ZERO,
            spawn_type: None,
            cfg,
        }
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.tcp.local_addr()?)
    }

    /// Spawn an entity of this type, owned by the connecting peer, on every
    /// new connection.
    pub fn set_spawn_on_connect(&mut self, type_id: TypeId) {
        self.spawn_type = Some(type_id);
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut EntityStore {
        &mut self.store
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Time spent with zero clients connected; the liveness policy in the
    /// main loop exits once this exceeds the configured idle timeout.
    pub fn idle_for(&self) -> Duration {
        self.idle
    }

    /// Accepts exactly one client (preamble + session handshake).
    pub async fn accept_one(&mut self) -> anyhow::Result<PeerId> {
        let (conn, addr) = self.tcp.accept().await?;
        self.admit(conn, addr).await
    }

    /// Accepts a client with timeout (non-blocking variant).
    pub async fn try_accept(&mut self, timeout: Duration) -> anyhow::Result<Option<PeerId>> {
        match tokio::time::timeout(timeout, self.tcp.accept()).await {
            Ok(Ok((conn, addr))) => self.admit(conn, addr).await.map(Some),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None), // Timeout
        }
    }

    async fn admit(&mut self, mut conn: ReliableConn, addr: SocketAddr) -> anyhow::Result<PeerId> {
        let hello = conn.recv().await?;
        let protocol = match hello {
            Frame::Hello { protocol } => protocol,
            other => anyhow::bail!("expected hello, got {other:?}"),
        };
        if protocol != PROTOCOL_VERSION {
            return Err(TransportError::ProtocolMismatch {
                ours: PROTOCOL_VERSION,
                theirs: protocol,
            }
            .into());
        }
        let udp_port = match conn.recv().await? {
            Frame::UdpHello { port } => port,
            other => anyhow::bail!("expected udp hello, got {other:?}"),
        };

        let peer = PeerId(self.next_peer_id);
        self.next_peer_id += 1;
        conn.send(&Frame::Welcome { peer_id: peer }).await?;

        let (reliable_tx, mut reliable_rx) = mpsc::unbounded_channel::<Frame>();
        let (mut read_half, mut write_half) = conn.into_split();

        tokio::spawn(async move {
            while let Some(frame) = reliable_rx.recv().await {
                if write_frame(&mut write_half, &frame).await.is_err() {
                    break;
                }
            }
        });

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Frame::Call { lane, payload }) => {
                        let msg = InboundMessage {
                            sender: peer,
                            lane,
                            payload,
                        };
                        if events.send(PeerEvent::Inbound(msg)).is_err() {
                            break;
                        }
                    }
                    Ok(other) => {
                        warn!(%peer, frame = ?other, "unexpected frame after preamble");
                    }
                    Err(_) => {
                        let _ = events.send(PeerEvent::Disconnected(peer));
                        break;
                    }
                }
            }
        });

        let udp_addr = SocketAddr::new(addr.ip(), udp_port);
        self.peers.insert(peer, PeerState {
            reliable_tx,
            udp_addr,
        });

        // Deal the session tokens before anything else flows; traffic from
        // this peer is not authentic until it echoes them back.
        match self.sessions.open(peer) {
            Ok(pair) => {
                let mut out = HubSender {
                    peers: &self.peers,
                    udp: &self.udp,
                };
                out.send(peer, Lane::Handshake, &pair.encode())?;
            }
            Err(err) => {
                // A second connection claiming a live peer id is never
                // re-keyed; the original session stands.
                warn!(%peer, error = %err, "duplicate session open rejected");
            }
        }

        if let Some(type_id) = self.spawn_type {
            match self.registry.instantiate(type_id) {
                Some(entity) => {
                    let id = self.store.spawn(entity, peer);
                    info!(%peer, %id, "spawned entity for new peer");
                }
                None => warn!(?type_id, "spawn-on-connect type not registered"),
            }
        }

        info!(%peer, %udp_addr, "peer connected");
        Ok(peer)
    }

    /// Executes one fixed step: drain queued socket events through the
    /// broker, advance replication, track idleness.
    pub fn step(&mut self, dt: Duration) -> anyhow::Result<()> {
        self.drain_events();

        let mut out = HubSender {
            peers: &self.peers,
            udp: &self.udp,
        };
        if let Err(err) = self
            .engine
            .tick(dt, &self.store, &self.registry, &mut out)
        {
            warn!(error = %err, "replication tick failed");
        }

        if self.peers.is_empty() {
            self.idle += dt;
        } else {
            self.idle = Duration::ZERO;
        }
        Ok(())
    }

    /// Runs the step loop for a number of ticks at the configured rate.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = Duration::from_secs_f32(1.0 / self.cfg.tick_hz as f32);
        let mut next = Instant::now();
        for _ in 0..ticks {
            next += dt;
            self.step(dt)?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                PeerEvent::Inbound(msg) => self.dispatch(msg),
                PeerEvent::Disconnected(peer) => self.on_disconnect(peer),
            }
        }
    }

    fn dispatch(&mut self, msg: InboundMessage) {
        match msg.lane {
            Lane::Rpc => {
                let mut out = HubSender {
                    peers: &self.peers,
                    udp: &self.udp,
                };
                // Per-envelope failures are logged and dropped; one bad or
                // hostile envelope must not stall the loop.
                if let Err(err) =
                    self.broker
                        .receive(&self.sessions, &mut self.store, &mut out, &msg.payload)
                {
                    warn!(sender = %msg.sender, error = %err, "dropping rpc envelope");
                }
            }
            Lane::Handshake | Lane::Replication => {
                warn!(sender = %msg.sender, lane = ?msg.lane, "unexpected inbound lane");
            }
        }
    }

    fn on_disconnect(&mut self, peer: PeerId) {
        if self.peers.remove(&peer).is_none() {
            return; // already gone
        }
        self.sessions.close(peer);
        let removed = self.store.remove_owned_by(peer);
        info!(%peer, entities = removed.len(), "peer disconnected");
    }

    /// Originates a call from server-side application code.
    pub fn invoke(
        &mut self,
        target: EntityId,
        method: &str,
        args: &[Value],
    ) -> Result<(), RpcError> {
        let mut out = HubSender {
            peers: &self.peers,
            udp: &self.udp,
        };
        self.broker
            .invoke(&self.sessions, &mut self.store, &mut out, target, method, args)
    }
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(
    mut cfg: RelayConfig,
    registry: TypeRegistry,
    methods: MethodTable,
) -> anyhow::Result<(RelayServer, RelayConfig)> {
    // Bind TCP first to get an ephemeral port, then bind UDP to that port.
    let tcp = ReliableListener::bind("127.0.0.1:0".parse()?).await?;
    let addr = tcp.local_addr()?;
    cfg.server_addr = addr.to_string();
    let udp = UdpSocket::bind(addr).await.context("udp bind")?;

    let server = RelayServer::assemble(cfg.clone(), tcp, udp, registry, methods);
    Ok((server, cfg))
}
