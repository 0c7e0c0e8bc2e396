// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bridge process lifecycle: socket setup with correct ownership and mode,
//! the accept loop, signal handling, and graceful drain on shutdown.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::UnixListener;
use tracing::{debug, error, info, warn};

use crate::dispatch::{serve_connection, BridgeState};

/// How long in-flight streams get to finish after shutdown is requested.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The group whose members may connect to per-user bridge sockets.
const SOCKET_GROUP: &str = "linuxio";

/// Bind the session socket: unlink stale node, listen, chmod 0660, and (when
/// running as root) chown `uid:linuxio-gid`. Any failing step tears down the
/// previous ones.
pub fn setup_socket(state: &BridgeState) -> anyhow::Result<UnixListener> {
    let path = &state.identity.socket_path;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create socket directory {}", parent.display()))?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("unlink stale socket {}", path.display()))
        }
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("bind unix socket {}", path.display()))?;

    if let Err(e) =
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))
            .with_context(|| format!("chmod 0660 {}", path.display()))
    {
        teardown_socket(path);
        return Err(e);
    }

    if nix::unistd::geteuid().is_root() {
        let gid = linuxio_gid();
        if let Err(e) = nix::unistd::chown(
            path.as_path(),
            Some(nix::unistd::Uid::from_raw(state.identity.uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        )
        .with_context(|| format!("chown {}:{gid} {}", state.identity.uid, path.display()))
        {
            teardown_socket(path);
            return Err(e);
        }
    }

    Ok(listener)
}

fn teardown_socket(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Gid of the `linuxio` group, 0 when the group does not exist.
fn linuxio_gid() -> u32 {
    match nix::unistd::Group::from_name(SOCKET_GROUP) {
        Ok(Some(group)) => group.gid.as_raw(),
        Ok(None) => {
            warn!("group {SOCKET_GROUP} not found, falling back to gid 0");
            0
        }
        Err(e) => {
            warn!(error = %e, "group lookup failed, falling back to gid 0");
            0
        }
    }
}

/// Latch shutdown on the first SIGINT/SIGTERM; force-exit on the second.
pub fn spawn_signal_handler(state: &Arc<BridgeState>) {
    let closing = state.closing.clone();
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
            }
        }
        closing.cancel();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM again, forcing exit");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT again, forcing exit");
            }
        }
        std::process::exit(130);
    });
}

/// Accept connections until shutdown, then drain in-flight streams with a
/// bounded grace and remove the socket node.
pub async fn run(state: Arc<BridgeState>, listener: UnixListener) -> anyhow::Result<()> {
    let socket_path = state.identity.socket_path.clone();
    info!(
        session_id = %state.identity.session_id,
        socket = %socket_path.display(),
        "bridge listening"
    );

    loop {
        tokio::select! {
            accept = listener.accept() => match accept {
                Ok((stream, _)) => {
                    let conn_state = Arc::clone(&state);
                    state.tracker.spawn(async move {
                        serve_connection(stream, conn_state).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            },
            _ = state.closing.cancelled() => {
                info!("shutdown requested, closing listener");
                break;
            }
        }
    }
    drop(listener);

    state.tracker.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, state.tracker.wait()).await.is_err() {
        warn!(grace = ?SHUTDOWN_GRACE, "in-flight streams outlived the grace period");
    }

    match std::fs::remove_file(&socket_path) {
        Ok(()) => debug!(path = %socket_path.display(), "socket removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(error = %e, "socket cleanup failed"),
    }

    info!("bridge exited cleanly");
    Ok(())
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
