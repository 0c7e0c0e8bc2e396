// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

/// LinuxIO front-end server: spawns per-user bridges and relays browser
/// streams onto their sockets.
#[derive(Debug, Parser)]
#[command(name = "linuxio-server", version, about)]
pub struct Config {
    /// HTTP port to listen on.
    #[arg(long, env = "LINUXIO_PORT", default_value = "8090")]
    pub port: u16,

    /// Host address to bind to.
    #[arg(long, env = "LINUXIO_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Token required on /ws (omit to disable auth; development only).
    #[arg(long, env = "LINUXIO_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Path to the bridge binary.
    #[arg(long, env = "LINUXIO_BRIDGE_BIN", default_value = "linuxio-bridge")]
    pub bridge_bin: PathBuf,

    /// Directory for per-session bridge sockets.
    #[arg(long, env = "LINUXIO_SOCKET_DIR", default_value = "/run/linuxio")]
    pub socket_dir: PathBuf,

    /// Runtime environment (development or production).
    #[arg(long, env = "LINUXIO_ENV", default_value = "production")]
    pub env: String,

    /// Log format (json or text).
    #[arg(long, env = "LINUXIO_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LINUXIO_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn is_development(&self) -> bool {
        self.env == "development"
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        match self.env.as_str() {
            "development" | "production" => {}
            other => anyhow::bail!("invalid environment: {other}"),
        }
        if self.auth_token.is_none() && !self.is_development() {
            anyhow::bail!("--auth-token is required in production");
        }
        Ok(())
    }
}

/// Initialize tracing from config.
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
