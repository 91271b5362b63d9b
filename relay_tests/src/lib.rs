//! Shared fixtures for the socket-level integration tests.

use std::time::Duration;

use relay_client::RelayClient;
use relay_server::RelayServer;
use relay_shared::{
    config::RelayConfig,
    pawn::Pawn,
    registry::{TypeId, TypeRegistry},
    rpc::MethodTable,
};

/// The registry/method-table pair every peer in a test must build
/// identically.
pub fn pawn_collaborators() -> (TypeRegistry, MethodTable, TypeId) {
    let mut registry = TypeRegistry::new();
    let type_id = Pawn::register_type(&mut registry);
    let mut methods = MethodTable::new();
    Pawn::register_methods(&mut methods);
    (registry, methods, type_id)
}

/// Installs a test-friendly tracing subscriber (once).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Connects a client while pumping the server's accept loop — the connect
/// preamble cannot complete unless the server admits the connection.
pub async fn connect_while_accepting(
    server: &mut RelayServer,
    cfg: &RelayConfig,
) -> anyhow::Result<RelayClient> {
    let (registry, methods, _) = pawn_collaborators();
    let cfg = cfg.clone();
    let connect = tokio::spawn(async move { RelayClient::connect(&cfg, registry, methods).await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let _ = server.try_accept(Duration::from_millis(1)).await?;
        if connect.is_finished() {
            return connect.await?;
        }
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for client connect"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
