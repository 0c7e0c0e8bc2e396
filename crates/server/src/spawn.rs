// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bridge process launcher.
//!
//! Spawns one `linuxio-bridge` per login session and hands it its bootstrap
//! object on FD 3 — secrets never touch the environment or the command
//! line.

use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tracing::{debug, info, warn};

/// How the bridge is launched for one session.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Path to the bridge binary.
    pub bridge_bin: PathBuf,
    /// Directory the per-session socket is created in.
    pub socket_dir: PathBuf,
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub development: bool,
    pub verbose: bool,
    pub server_base_url: Option<String>,
}

/// A running bridge and the credentials to reach it.
pub struct BridgeProcess {
    pub session_id: String,
    pub secret: String,
    pub socket_path: PathBuf,
    child: tokio::process::Child,
}

/// Spawn the bridge with a freshly minted session id and secret.
pub async fn spawn_bridge(opts: &SpawnOptions) -> anyhow::Result<BridgeProcess> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let secret = uuid::Uuid::new_v4().simple().to_string();
    let socket_path = opts.socket_dir.join(format!("linuxio-bridge-{session_id}.sock"));

    let bootstrap = json!({
        "session_id": session_id,
        "username": opts.username,
        "uid": opts.uid,
        "gid": opts.gid,
        "secret": secret,
        "socket_path": socket_path.to_string_lossy(),
        "server_base_url": opts.server_base_url,
        "verbose": if opts.verbose { "1" } else { "0" },
    });
    let payload = serde_json::to_vec(&bootstrap)?;

    // The bootstrap rides a pipe whose read end becomes the child's FD 3.
    // Written before the spawn: the payload is far below the pipe buffer, so
    // the write cannot block on the child.
    let (read_fd, write_fd) =
        nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).context("create bootstrap pipe")?;
    {
        let mut writer = std::fs::File::from(write_fd);
        writer.write_all(&payload).context("write bootstrap payload")?;
    }

    let mut cmd = tokio::process::Command::new(&opts.bridge_bin);
    cmd.arg("--env")
        .arg(if opts.development { "development" } else { "production" })
        .stdin(Stdio::null())
        .kill_on_drop(true);
    if opts.verbose {
        cmd.arg("--verbose");
    }

    let raw_read = read_fd.as_raw_fd();
    // Invariant: `read_fd` stays open in the parent until after spawn, so
    // the raw descriptor captured here is valid inside the forked child.
    // dup2 clears O_CLOEXEC on the new FD 3, which therefore survives exec
    // while the O_CLOEXEC originals close.
    #[allow(unsafe_code)]
    unsafe {
        cmd.pre_exec(move || {
            if libc::dup2(raw_read, bridge::bootstrap::BOOTSTRAP_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().with_context(|| {
        format!("spawn bridge binary {}", opts.bridge_bin.display())
    })?;
    drop(read_fd);

    info!(
        session_id = %session_id,
        username = %opts.username,
        socket = %socket_path.display(),
        "bridge spawned"
    );

    Ok(BridgeProcess { session_id, secret, socket_path, child })
}

impl BridgeProcess {
    /// Wait until the bridge socket accepts connections.
    pub async fn wait_ready(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::net::UnixStream::connect(&self.socket_path).await {
                Ok(_) => return Ok(()),
                Err(e) if tokio::time::Instant::now() >= deadline => {
                    anyhow::bail!(
                        "bridge socket {} not ready within {timeout:?}: {e}",
                        self.socket_path.display()
                    );
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(25)).await,
            }
        }
    }

    /// Graceful stop: SIGTERM, bounded wait, SIGKILL as a last resort.
    pub async fn shutdown(mut self, grace: Duration) -> anyhow::Result<()> {
        if let Some(pid) = self.child.id() {
            debug!(pid, "sending SIGTERM to bridge");
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(?status, "bridge exited");
            }
            Err(_) => {
                warn!("bridge ignored SIGTERM, killing");
                let _ = self.child.kill().await;
            }
        }
        Ok(())
    }

    /// Whether the process has exited (without reaping it).
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait for the process to exit on its own.
    pub async fn wait_exit(&mut self) -> anyhow::Result<std::process::ExitStatus> {
        Ok(self.child.wait().await?)
    }
}

#[cfg(test)]
#[path = "spawn_tests.rs"]
mod tests;
