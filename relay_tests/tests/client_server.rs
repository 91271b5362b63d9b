//! Full socket-based integration tests for client ↔ server communication.

use std::time::Duration;

use relay_client::RelayClient;
use relay_server::server::bind_ephemeral;
use relay_shared::{
    codec::Value,
    config::RelayConfig,
    pawn::Pawn,
    registry::{EntityId, Replicable},
};
use relay_tests::{connect_while_accepting, init_tracing, pawn_collaborators};

const TICK: Duration = Duration::from_millis(10);

fn test_config() -> RelayConfig {
    RelayConfig {
        tick_hz: 100,
        snapshot_interval_secs: 0.02,
        ..RelayConfig::default()
    }
}

/// Steps the server and polls the clients until `done` holds or the
/// deadline passes.
macro_rules! pump_until {
    ($server:expr, [$($client:expr),*], $done:expr, $what:literal) => {{
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let _ = $server.try_accept(Duration::from_millis(1)).await?;
            $server.step(TICK)?;
            $($client.poll();)*
            if $done {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {}",
                $what
            );
            tokio::time::sleep(TICK).await;
        }
    }};
}

fn pawn_of(client: &RelayClient, id: EntityId) -> Pawn {
    client
        .store()
        .get(id)
        .and_then(|e| e.as_any().downcast_ref::<Pawn>())
        .cloned()
        .expect("pawn not replicated yet")
}

/// The end-to-end scenario: connect, receive tokens, call an owner-gated
/// server method, observe the result replicated back.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_connects_calls_and_sees_replication() -> anyhow::Result<()> {
    init_tracing();

    let (registry, methods, pawn_type) = pawn_collaborators();
    let (mut server, cfg) = bind_ephemeral(test_config(), registry, methods).await?;
    server.set_spawn_on_connect(pawn_type);

    let mut client = connect_while_accepting(&mut server, &cfg).await?;

    // The handshake delivers a token pair before anything else.
    pump_until!(server, [client], client.is_ready(), "session handshake");
    let pair = client.session().expect("token pair installed");
    assert_eq!(
        server.sessions().tokens(client.peer_id),
        Some(pair),
        "client holds exactly the pair the server dealt"
    );

    // The spawned pawn reaches the client through a snapshot, owner intact.
    pump_until!(
        server,
        [client],
        !client.owned_entities().is_empty(),
        "pawn replication"
    );
    let pawn_id = client.owned_entities()[0];
    assert_eq!(pawn_of(&client, pawn_id).owner(), client.peer_id);
    let report = client.last_report.as_ref().expect("a snapshot was applied");
    assert!(report.created.contains(&pawn_id) || report.updated.contains(&pawn_id));

    // Owner-gated call executes on the server; the rename flows back down.
    client.invoke(pawn_id, "rename", &[Value::string("Ada")])?;
    pump_until!(
        server,
        [client],
        pawn_of(&client, pawn_id).name.as_deref() == Some("Ada"),
        "rename roundtrip"
    );

    let server_pawn = server
        .store()
        .get(pawn_id)
        .and_then(|e| e.as_any().downcast_ref::<Pawn>())
        .unwrap();
    assert_eq!(server_pawn.name.as_deref(), Some("Ada"));
    Ok(())
}

/// A call from one client fans out through the server to the other client,
/// exactly once, and never back to the originator.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn calls_fan_out_between_clients() -> anyhow::Result<()> {
    init_tracing();

    let (registry, methods, pawn_type) = pawn_collaborators();
    let (mut server, cfg) = bind_ephemeral(test_config(), registry, methods).await?;
    server.set_spawn_on_connect(pawn_type);

    let mut alice = connect_while_accepting(&mut server, &cfg).await?;
    let mut bob = connect_while_accepting(&mut server, &cfg).await?;

    // Both peers fully replicated: each sees two pawns.
    pump_until!(
        server,
        [alice, bob],
        alice.is_ready()
            && bob.is_ready()
            && alice.store().len() == 2
            && bob.store().len() == 2,
        "both clients replicated"
    );

    let alice_pawn = alice.owned_entities()[0];

    // `cheer` is AllowAny/RunOnAll: alice executes locally at invoke time,
    // the server executes on receipt, and bob executes via the relay.
    alice.invoke(alice_pawn, "cheer", &[])?;

    pump_until!(
        server,
        [alice, bob],
        pawn_of(&bob, alice_pawn).cheers >= 1,
        "cheer relayed to the other client"
    );

    assert_eq!(
        pawn_of(&bob, alice_pawn).cheers,
        1,
        "relay reaches the other client exactly once"
    );
    let server_cheers = server
        .store()
        .get(alice_pawn)
        .and_then(|e| e.as_any().downcast_ref::<Pawn>())
        .unwrap()
        .cheers;
    assert_eq!(server_cheers, 1, "no echo back through the originator");
    Ok(())
}

/// Disconnecting a peer evicts its session and despawns its entities; the
/// survivor sees the departure through the next snapshots.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_tears_down_session_and_entities() -> anyhow::Result<()> {
    init_tracing();

    let (registry, methods, pawn_type) = pawn_collaborators();
    let (mut server, cfg) = bind_ephemeral(test_config(), registry, methods).await?;
    server.set_spawn_on_connect(pawn_type);

    let mut alice = connect_while_accepting(&mut server, &cfg).await?;
    let mut bob = connect_while_accepting(&mut server, &cfg).await?;

    pump_until!(
        server,
        [alice, bob],
        alice.store().len() == 2 && bob.store().len() == 2,
        "both clients replicated"
    );
    let bob_peer = bob.peer_id;

    drop(bob);

    pump_until!(
        server,
        [alice],
        server.peer_count() == 1 && alice.store().len() == 1,
        "departure observed"
    );

    assert!(!server.sessions().is_connected(bob_peer));
    assert_eq!(alice.owned_entities().len(), 1);
    Ok(())
}
