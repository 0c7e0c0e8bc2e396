// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bootstrap ingestion — the bridge receives its per-session configuration
//! as a JSON object on inherited file descriptor 3, so secrets never touch
//! the environment or the command line.

use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;

/// Maximum accepted bootstrap payload.
pub const MAX_BOOTSTRAP_BYTES: usize = 64 * 1024;

/// The FD number the front-end writes the bootstrap object to.
pub const BOOTSTRAP_FD: i32 = 3;

/// The raw bootstrap object as written by the front-end.
#[derive(Debug, Clone, Deserialize)]
pub struct Bootstrap {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub socket_path: String,
    #[serde(default)]
    pub server_base_url: Option<String>,
    #[serde(default)]
    pub server_cert: Option<String>,
    #[serde(default)]
    pub verbose: Option<String>,
    #[serde(default)]
    pub log_fd: Option<i32>,
}

/// Session identity captured at bootstrap. Never mutated; lifetime equals
/// the bridge process lifetime.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub session_id: String,
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub socket_path: PathBuf,
    pub secret: String,
    pub server_base_url: Option<String>,
    pub server_cert: Option<String>,
}

impl Bootstrap {
    /// Parse and validate a bootstrap payload.
    ///
    /// Missing `secret` or `session_id` is fatal; everything else has a
    /// usable default.
    pub fn parse(raw: &[u8]) -> anyhow::Result<Self> {
        if raw.len() > MAX_BOOTSTRAP_BYTES {
            anyhow::bail!("bootstrap payload exceeds {MAX_BOOTSTRAP_BYTES} bytes");
        }
        let bootstrap: Bootstrap =
            serde_json::from_slice(raw).context("parse bootstrap JSON")?;
        if bootstrap.secret.is_empty() {
            anyhow::bail!("bootstrap is missing required field: secret");
        }
        if bootstrap.session_id.is_empty() {
            anyhow::bail!("bootstrap is missing required field: session_id");
        }
        if bootstrap.socket_path.is_empty() {
            anyhow::bail!("bootstrap is missing required field: socket_path");
        }
        Ok(bootstrap)
    }

    /// Whether the optional `verbose` flag is truthy (`1`, `true`, `yes`, `on`).
    pub fn verbose(&self) -> bool {
        matches!(
            self.verbose.as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("1") | Some("true") | Some("yes") | Some("on")
        )
    }

    pub fn identity(&self) -> SessionIdentity {
        SessionIdentity {
            session_id: self.session_id.clone(),
            username: self.username.clone(),
            uid: self.uid,
            gid: self.gid,
            socket_path: PathBuf::from(&self.socket_path),
            secret: self.secret.clone(),
            server_base_url: self.server_base_url.clone(),
            server_cert: self.server_cert.clone(),
        }
    }
}

/// Read the bootstrap object from FD 3.
///
/// Reads to EOF (the front-end closes its end after writing), enforcing the
/// size cap. The inherited environment is cleared afterwards so nothing
/// secret or stale leaks into handlers; subsequent lookups read the captured
/// object instead.
pub fn read_from_fd3() -> anyhow::Result<Bootstrap> {
    // Invariant: FD 3 is inherited from the front-end spawner and owned
    // exclusively by this function; adopting it as a File is the only FD-3
    // access in the process.
    #[allow(unsafe_code)]
    let mut file = unsafe {
        use std::os::unix::io::FromRawFd;
        std::fs::File::from_raw_fd(BOOTSTRAP_FD)
    };
    let mut raw = Vec::new();
    file.by_ref()
        .take((MAX_BOOTSTRAP_BYTES + 1) as u64)
        .read_to_end(&mut raw)
        .context("read bootstrap from fd 3")?;
    let bootstrap = Bootstrap::parse(&raw)?;

    clear_environment();
    Ok(bootstrap)
}

/// Drop every inherited environment variable.
fn clear_environment() {
    for (key, _) in std::env::vars_os() {
        std::env::remove_var(key);
    }
}

/// Redirect stdout/stderr onto the bootstrap `log_fd`, development mode only.
pub fn redirect_logs(log_fd: i32) -> anyhow::Result<()> {
    if log_fd <= 0 {
        anyhow::bail!("log_fd must be a positive file descriptor, got {log_fd}");
    }
    // Invariant: log_fd was inherited open from the spawner; dup2 onto the
    // standard FDs does not close or invalidate it.
    #[allow(unsafe_code)]
    unsafe {
        if libc::dup2(log_fd, libc::STDOUT_FILENO) < 0
            || libc::dup2(log_fd, libc::STDERR_FILENO) < 0
        {
            return Err(std::io::Error::last_os_error()).context("dup2 log_fd over stdio");
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "bootstrap_tests.rs"]
mod tests;
