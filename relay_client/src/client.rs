//! Client implementation.
//!
//! The client maintains:
//! - A reliable control stream (preamble, session handshake, call envelopes)
//! - An unreliable datagram socket receiving snapshots
//! - Its single session (the token pair the server dealt it)
//! - A local entity store reconciled against every inbound snapshot
//!
//! Socket reads run on background tasks; everything funnels into one event
//! queue that [`RelayClient::poll`] drains on the caller's thread, so the
//! broker and reconciliation never race.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Context;
use relay_shared::{
    codec::Value,
    config::RelayConfig,
    registry::{EntityId, EntityStore, TypeRegistry},
    replication::{ApplyReport, ReplicationEngine, Snapshot},
    rpc::{MethodTable, RpcBroker, RpcError},
    session::{SessionManager, TokenPair},
    transport::{
        read_frame, write_frame, Frame, InboundMessage, Lane, PeerId, PeerSender, ReliableConn,
        TransportError, UnreliableConn, PROTOCOL_VERSION,
    },
};
use tokio::{net::TcpStream, sync::mpsc};
use tracing::{debug, info, warn};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Transport is up, session tokens not yet received.
    Connected,
    /// Session handshake installed; calls are now authenticated.
    Ready,
    /// Connection lost.
    Disconnected,
}

enum ClientEvent {
    Inbound(InboundMessage),
    Disconnected,
}

/// Outbound half as seen from a client: everything goes to the server.
struct ServerSender<'a> {
    tx: &'a mpsc::UnboundedSender<Frame>,
    server: PeerId,
}

impl PeerSender for ServerSender<'_> {
    fn send(&mut self, _peer: PeerId, lane: Lane, payload: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(Frame::call(lane, payload.to_vec()))
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn peers(&self) -> Vec<PeerId> {
        vec![self.server]
    }
}

/// High-level relay client.
pub struct RelayClient {
    pub cfg: RelayConfig,
    pub peer_id: PeerId,
    pub state: ClientState,

    sessions: SessionManager,
    broker: RpcBroker,
    store: EntityStore,
    registry: TypeRegistry,

    reliable_tx: mpsc::UnboundedSender<Frame>,
    events_rx: mpsc::UnboundedReceiver<ClientEvent>,

    /// What the most recent snapshot application did.
    pub last_report: Option<ApplyReport>,
}

impl RelayClient {
    /// Connects to a server and performs the transport preamble.
    ///
    /// The registry and method table must match the server's — same types
    /// in the same order, same method declarations.
    pub async fn connect(
        cfg: &RelayConfig,
        registry: TypeRegistry,
        methods: MethodTable,
    ) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        info!(server = %server_addr, "connecting to server");

        // Bind UDP first so we can tell the server where to aim snapshots.
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let unreliable = UnreliableConn::connect(bind, server_addr).await?;
        let udp_port = unreliable.local_addr().context("udp local_addr")?.port();

        let stream = TcpStream::connect(server_addr)
            .await
            .context("tcp connect")?;
        let mut reliable = ReliableConn::new(stream);

        reliable
            .send(&Frame::Hello {
                protocol: PROTOCOL_VERSION,
            })
            .await?;
        reliable.send(&Frame::UdpHello { port: udp_port }).await?;

        let peer_id = match reliable.recv().await? {
            Frame::Welcome { peer_id } => peer_id,
            other => anyhow::bail!("expected welcome, got {other:?}"),
        };
        info!(%peer_id, "connected to server");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (reliable_tx, mut reliable_rx) = mpsc::unbounded_channel::<Frame>();
        let (mut read_half, mut write_half) = reliable.into_split();

        tokio::spawn(async move {
            while let Some(frame) = reliable_rx.recv().await {
                if write_frame(&mut write_half, &frame).await.is_err() {
                    break;
                }
            }
        });

        let server_peer = cfg.server_peer();
        let tcp_events = events_tx.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Frame::Call { lane, payload }) => {
                        let msg = InboundMessage {
                            sender: server_peer,
                            lane,
                            payload,
                        };
                        if tcp_events.send(ClientEvent::Inbound(msg)).is_err() {
                            break;
                        }
                    }
                    Ok(other) => {
                        warn!(frame = ?other, "unexpected frame from server");
                    }
                    Err(_) => {
                        let _ = tcp_events.send(ClientEvent::Disconnected);
                        break;
                    }
                }
            }
        });

        let udp_events = events_tx;
        tokio::spawn(async move {
            loop {
                match unreliable.recv().await {
                    Ok(Frame::Call { lane, payload }) => {
                        let msg = InboundMessage {
                            sender: server_peer,
                            lane,
                            payload,
                        };
                        if udp_events.send(ClientEvent::Inbound(msg)).is_err() {
                            break;
                        }
                    }
                    Ok(other) => {
                        warn!(frame = ?other, "unexpected datagram frame");
                    }
                    // A malformed datagram is dropped, not fatal.
                    Err(TransportError::MalformedFrame(reason)) => {
                        debug!(reason, "dropping malformed datagram");
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            cfg: cfg.clone(),
            peer_id,
            state: ClientState::Connected,
            sessions: SessionManager::new(),
            broker: RpcBroker::new(peer_id, server_peer, methods),
            store: EntityStore::new(),
            registry,
            reliable_tx,
            events_rx,
            last_report: None,
        })
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn session(&self) -> Option<TokenPair> {
        self.sessions.tokens(self.peer_id)
    }

    pub fn is_ready(&self) -> bool {
        self.state == ClientState::Ready
    }

    /// Entities this peer owns, in id order.
    pub fn owned_entities(&self) -> Vec<EntityId> {
        self.store
            .iter()
            .filter(|(_, e)| e.owner() == self.peer_id)
            .map(|(id, _)| id)
            .collect()
    }

    /// Drains queued socket events through the protocol components.
    pub fn poll(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                ClientEvent::Inbound(msg) => self.dispatch(msg),
                ClientEvent::Disconnected => {
                    self.sessions.close(self.peer_id);
                    self.state = ClientState::Disconnected;
                    info!("disconnected from server");
                }
            }
        }
    }

    fn dispatch(&mut self, msg: InboundMessage) {
        match msg.lane {
            Lane::Handshake => match TokenPair::decode(&msg.payload) {
                Ok(pair) => match self.sessions.install(self.peer_id, pair) {
                    Ok(()) => {
                        self.state = ClientState::Ready;
                        info!("session established");
                    }
                    Err(err) => warn!(error = %err, "ignoring repeated handshake"),
                },
                Err(err) => warn!(error = %err, "malformed handshake payload"),
            },
            Lane::Rpc => {
                let mut out = ServerSender {
                    tx: &self.reliable_tx,
                    server: self.cfg.server_peer(),
                };
                if let Err(err) =
                    self.broker
                        .receive(&self.sessions, &mut self.store, &mut out, &msg.payload)
                {
                    warn!(error = %err, "dropping rpc envelope");
                }
            }
            Lane::Replication => {
                match Snapshot::decode(&msg.payload, &self.registry) {
                    Ok(snapshot) => {
                        match ReplicationEngine::apply(&snapshot, &mut self.store, &self.registry)
                        {
                            Ok(report) => {
                                debug!(
                                    created = report.created.len(),
                                    updated = report.updated.len(),
                                    deleted = report.deleted.len(),
                                    "snapshot reconciled"
                                );
                                self.last_report = Some(report);
                            }
                            Err(err) => warn!(error = %err, "snapshot apply failed"),
                        }
                    }
                    Err(err) => warn!(error = %err, "snapshot decode failed"),
                }
            }
        }
    }

    /// Originates an authenticated call from client application code.
    pub fn invoke(
        &mut self,
        target: EntityId,
        method: &str,
        args: &[Value],
    ) -> Result<(), RpcError> {
        let mut out = ServerSender {
            tx: &self.reliable_tx,
            server: self.cfg.server_peer(),
        };
        self.broker
            .invoke(&self.sessions, &mut self.store, &mut out, target, method, args)
    }
}
