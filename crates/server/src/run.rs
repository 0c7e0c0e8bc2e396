// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level server runner: spawn the bridge for the logged-in user, serve
//! the relay endpoint, and tear both down on shutdown.

use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::spawn::{spawn_bridge, SpawnOptions};
use crate::transport::{build_router, ServerState};

/// How long the bridge gets to come up before startup fails.
const BRIDGE_READY_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace passed to the bridge on shutdown; matches the bridge's own drain.
const BRIDGE_STOP_GRACE: Duration = Duration::from_secs(6);

/// Run the server to completion.
///
/// The full login flow (HTTPS, cookies, PAM) lives outside the core; here
/// the process user is the session user, so one bridge is spawned for them
/// at startup and registered under its session id.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let uid = nix::unistd::geteuid().as_raw();
    let gid = nix::unistd::getegid().as_raw();
    let username = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| "unknown".to_owned());

    let bridge = spawn_bridge(&SpawnOptions {
        bridge_bin: config.bridge_bin.clone(),
        socket_dir: config.socket_dir.clone(),
        username,
        uid,
        gid,
        development: config.is_development(),
        verbose: config.log_level == "debug" || config.log_level == "trace",
        server_base_url: Some(format!("http://{}:{}", config.host, config.port)),
    })
    .await?;
    bridge.wait_ready(BRIDGE_READY_TIMEOUT).await?;

    let state = ServerState::new(config.auth_token.clone());
    state.register_session(&bridge.session_id, bridge.socket_path.clone());
    info!(session_id = %bridge.session_id, "session registered");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                _ = async {
                    if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
                } => info!("received SIGTERM"),
            }
            shutdown.cancel();
        });
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("bind {addr}"))?;
    info!("HTTP listening on {}", listener.local_addr()?);

    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("HTTP server")?;

    bridge.shutdown(BRIDGE_STOP_GRACE).await?;
    info!("server exited cleanly");
    Ok(())
}
