//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p relay_client -- [--addr 127.0.0.1:41000] [--name Ada]
//!
//! Connects to a relay server, waits for the session handshake, then names
//! its pawn and walks it in a small circle so replication has something to
//! carry. Runs until the server goes away.

use std::env;
use std::time::Duration;

use anyhow::Context;
use relay_client::{ClientState, RelayClient};
use relay_shared::{
    codec::Value, config::RelayConfig, pawn::Pawn, registry::TypeRegistry, rpc::MethodTable,
};
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
            "--name" if i + 1 < args.len() => {
                cfg.client_name = args[i + 1].clone();
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

    let mut registry = TypeRegistry::new();
    Pawn::register_type(&mut registry);
    let mut methods = MethodTable::new();
    Pawn::register_methods(&mut methods);

    let mut client = RelayClient::connect(&cfg, registry, methods)
        .await
        .context("connect")?;

    let tick = Duration::from_secs_f32(1.0 / cfg.tick_hz as f32);
    let mut named = false;
    let mut step = 0u32;

    loop {
        client.poll();

        if client.state == ClientState::Disconnected {
            info!("server went away, exiting");
            return Ok(());
        }

        if client.is_ready() {
            if let Some(&pawn_id) = client.owned_entities().first() {
                if !named {
                    client.invoke(pawn_id, "rename", &[Value::string(cfg.client_name.clone())])?;
                    client.invoke(pawn_id, "cheer", &[])?;
                    named = true;
                    info!(%pawn_id, name = %cfg.client_name, "claimed pawn");
                }
                // Walk a slow circle so snapshots have movement to carry.
                if step % 30 == 0 {
                    let angle = step as f32 / 300.0;
                    client.invoke(
                        pawn_id,
                        "move_to",
                        &[
                            Value::F32(angle.cos() * 5.0),
                            Value::F32(0.0),
                            Value::F32(angle.sin() * 5.0),
                        ],
                    )?;
                }
            }
        }

        step = step.wrapping_add(1);
        tokio::time::sleep(tick).await;
    }
}
