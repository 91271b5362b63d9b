//! Smoke tests: the server boots, ticks, and applies its idle policy.

use std::time::Duration;

use relay_server::server::bind_ephemeral;
use relay_shared::config::RelayConfig;
use relay_tests::pawn_collaborators;

/// Smoke test: server can run a few ticks without panicking.
#[tokio::test]
async fn server_runs_few_ticks() -> anyhow::Result<()> {
    let (registry, methods, _) = pawn_collaborators();
    let (mut server, _cfg) = bind_ephemeral(RelayConfig::default(), registry, methods).await?;
    server.run_for_ticks(3).await?;
    Ok(())
}

/// With no clients, idle time accumulates past the configured timeout —
/// the signal the main loop uses to exit.
#[tokio::test]
async fn idle_server_reports_timeout() -> anyhow::Result<()> {
    let cfg = RelayConfig {
        idle_timeout_secs: 0.05,
        ..RelayConfig::default()
    };
    let (registry, methods, _) = pawn_collaborators();
    let (mut server, cfg) = bind_ephemeral(cfg, registry, methods).await?;

    for _ in 0..10 {
        server.step(Duration::from_millis(10))?;
    }
    assert!(server.idle_for() >= cfg.idle_timeout());
    Ok(())
}
