//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p relay_server -- [--addr 127.0.0.1:41000] [--tick-hz 60]
//!                                [--idle-timeout 60]
//!
//! The server listens for client connections, deals each one a session
//! token pair, relays authenticated calls between peers, and broadcasts
//! entity snapshots on a fixed interval. With no clients connected it
//! exits after the idle timeout.

use std::env;
use std::time::Duration;

use anyhow::Context;
use relay_server::RelayServer;
use relay_shared::{config::RelayConfig, pawn::Pawn, registry::TypeRegistry, rpc::MethodTable};
use tracing::info;

fn parse_args() -> RelayConfig {
    let mut cfg = RelayConfig::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(60);
                i += 2;
            }
            "--idle-timeout" if i + 1 < args.len() => {
                cfg.idle_timeout_secs = args[i + 1].parse().unwrap_or(60.0);
                i += 2;
            }
            _ => i += 1,
        }
    }
    cfg
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args();
    info!(addr = %cfg.server_addr, tick_hz = cfg.tick_hz, "starting relay server");

    let mut registry = TypeRegistry::new();
    let pawn_type = Pawn::register_type(&mut registry);
    let mut methods = MethodTable::new();
    Pawn::register_methods(&mut methods);

    let mut server = RelayServer::new(cfg.clone(), registry, methods)
        .await
        .context("create server")?;
    server.set_spawn_on_connect(pawn_type);
    let local = server.local_addr()?;
    info!(%local, "server listening");

    let tick = Duration::from_secs_f32(1.0 / cfg.tick_hz as f32);
    let mut next_tick = tokio::time::Instant::now();

    loop {
        // Accept newcomers without blocking the tick.
        if let Some(peer) = server.try_accept(Duration::from_millis(1)).await? {
            info!(%peer, "new peer accepted");
        }

        server.step(tick)?;

        if server.idle_for() >= cfg.idle_timeout() {
            info!(
                idle_secs = server.idle_for().as_secs(),
                "no clients connected, shutting down"
            );
            return Ok(());
        }

        next_tick += tick;
        tokio::time::sleep_until(next_tick).await;
    }
}
