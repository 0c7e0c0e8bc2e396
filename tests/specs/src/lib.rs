// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end bridge specs.
//!
//! Runs a real bridge supervisor on a real unix socket (in-process, so the
//! registry and shutdown paths are the production ones) and, for relay
//! specs, a real axum server reached through a WebSocket client.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use bridge::dispatch::BridgeState;
use bridge::proto::request::Request;
use bridge::supervisor;

static BUILTINS: Once = Once::new();

/// Register the built-in handlers plus spec-only fixtures, once per test
/// process.
pub fn ensure_handlers() {
    BUILTINS.call_once(|| {
        if let Err(e) = bridge::handlers::register_builtins() {
            eprintln!("builtin registration failed: {e}");
        }
        if let Err(e) = register_spec_fixtures() {
            eprintln!("spec fixture registration failed: {e}");
        }
    });
}

/// A stream handler that emits progress every 100 ms until cancelled —
/// the "long-running handler" of the shutdown-under-load scenario.
fn register_spec_fixtures() -> anyhow::Result<()> {
    bridge::registry::register_stream(
        "spec-slow",
        Arc::new(
            |ctx: bridge::registry::HandlerCtx,
             _args: Vec<String>,
             _input: bridge::stream_input::StreamInput,
             events: bridge::events::Events| {
                async move {
                    let mut beats: u64 = 0;
                    loop {
                        tokio::select! {
                            _ = ctx.cancel.cancelled() => {
                                // Shutdown and abort share the context; report
                                // the cause the client expects for each.
                                return Err(if ctx.shutdown.is_cancelled() {
                                    bridge::error::HandlerError::canceled()
                                } else {
                                    bridge::error::HandlerError::aborted()
                                });
                            }
                            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                                beats += 1;
                                events
                                    .progress(&serde_json::json!({"beat": beats}))
                                    .await?;
                            }
                        }
                    }
                }
            },
        ),
    )?;
    Ok(())
}

/// A live bridge on a temp socket, stopped and cleaned up by [`stop`].
pub struct TestBridge {
    pub state: Arc<BridgeState>,
    pub socket_path: PathBuf,
    supervisor: tokio::task::JoinHandle<anyhow::Result<()>>,
    _dir: tempfile::TempDir,
}

/// Start a bridge with fresh credentials on a fresh socket.
pub async fn start_bridge() -> anyhow::Result<TestBridge> {
    ensure_handlers();
    let dir = tempfile::tempdir()?;

    let mut identity = bridge::test_support::identity(
        &uuid::Uuid::new_v4().to_string(),
        &uuid::Uuid::new_v4().simple().to_string(),
    );
    identity.socket_path = dir.path().join("bridge.sock");
    let socket_path = identity.socket_path.clone();

    let state = BridgeState::new(identity);
    let listener = supervisor::setup_socket(&state)?;
    let task = tokio::spawn(supervisor::run(Arc::clone(&state), listener));

    Ok(TestBridge { state, socket_path, supervisor: task, _dir: dir })
}

impl TestBridge {
    pub async fn connect(&self) -> anyhow::Result<tokio::net::UnixStream> {
        Ok(tokio::net::UnixStream::connect(&self.socket_path).await?)
    }

    /// A request carrying this bridge's valid credentials.
    pub fn request(&self, namespace: &str, command: &str, args: &[&str]) -> Request {
        bridge::test_support::authed_request(&self.state.identity, namespace, command, args)
    }

    /// Trigger shutdown (the signal handler does exactly this latch) and
    /// wait for the supervisor to drain and exit.
    pub async fn stop(self) -> anyhow::Result<()> {
        self.state.closing.cancel();
        tokio::time::timeout(Duration::from_secs(7), self.supervisor).await???;
        Ok(())
    }

    /// Wait for a supervisor that is expected to exit on its own (e.g.
    /// after a `control/shutdown` RPC).
    pub async fn wait_exit(self) -> anyhow::Result<()> {
        tokio::time::timeout(Duration::from_secs(7), self.supervisor).await???;
        Ok(())
    }
}
