// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level bridge runner — bootstrap ingestion through graceful exit.

use tracing::{info, warn};

use crate::bootstrap;
use crate::config::{init_tracing, Config};
use crate::dispatch::BridgeState;
use crate::handlers;
use crate::supervisor;

/// Run the bridge to completion.
///
/// Exit-code contract: `Ok` means a clean shutdown (exit 0); any error here
/// is a bootstrap or socket setup failure (exit 1), reported by `main`.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let bootstrap = bootstrap::read_from_fd3()?;

    // Development convenience: mirror stdio into the spawner's log pipe.
    if config.is_development() {
        if let Some(log_fd) = bootstrap.log_fd {
            if log_fd > 0 {
                if let Err(e) = bootstrap::redirect_logs(log_fd) {
                    eprintln!("warning: log redirect failed: {e}");
                }
            }
        }
    }

    init_tracing(config.verbose || bootstrap.verbose(), !config.is_development());
    info!(
        session_id = %bootstrap.session_id,
        username = %bootstrap.username,
        uid = bootstrap.uid,
        "bootstrap ingested"
    );

    let state = BridgeState::new(bootstrap.identity());
    handlers::register_builtins()?;

    let listener = supervisor::setup_socket(&state)?;
    supervisor::spawn_signal_handler(&state);

    let result = supervisor::run(state, listener).await;
    if let Err(ref e) = result {
        warn!(error = %e, "supervisor exited with error");
    }
    result
}
