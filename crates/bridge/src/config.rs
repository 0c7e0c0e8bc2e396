// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;

/// Per-user privileged bridge for the LinuxIO web console.
///
/// All real configuration arrives through the FD-3 bootstrap; the command
/// line only selects the runtime environment and log verbosity.
#[derive(Debug, Parser)]
#[command(name = "linuxio-bridge", about, disable_version_flag = true)]
pub struct Config {
    /// Runtime environment.
    #[arg(long, value_enum, default_value = "production")]
    pub env: EnvMode,

    /// Verbose logging (the bootstrap `verbose` flag also enables this).
    #[arg(long)]
    pub verbose: bool,

    /// Print name and version, then exit.
    #[arg(long = "version", short = 'v')]
    pub version: bool,

    /// Ignored; accepted so older spawners can pass extra arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
    pub rest: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EnvMode {
    Development,
    Production,
}

impl Config {
    /// `--version`, `-v`, or a bare `version` argument.
    pub fn wants_version(&self) -> bool {
        self.version || self.rest.first().map(String::as_str) == Some("version")
    }

    pub fn is_development(&self) -> bool {
        self.env == EnvMode::Development
    }
}

/// Initialize tracing. JSON format in production, plain text in development.
///
/// Uses `try_init` so repeated calls (tests) are harmless.
pub fn init_tracing(verbose: bool, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let result = if json {
        fmt::fmt().with_env_filter(filter).json().try_init()
    } else {
        fmt::fmt().with_env_filter(filter).try_init()
    };
    drop(result);
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
