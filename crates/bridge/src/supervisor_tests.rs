// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::BridgeState;
use crate::proto::request::Status;
use crate::supervisor::{run, setup_socket};
use crate::test_support::{authed_request, read_response, send_request};

fn state_with_socket(dir: &tempfile::TempDir) -> Arc<BridgeState> {
    let mut identity = crate::test_support::identity("sess-sup", "s3cret");
    identity.socket_path = dir.path().join("bridge.sock");
    BridgeState::new(identity)
}

#[tokio::test]
async fn socket_is_created_with_0660() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let state = state_with_socket(&dir);

    let listener = setup_socket(&state)?;
    let meta = std::fs::metadata(&state.identity.socket_path)?;
    assert_eq!(meta.permissions().mode() & 0o777, 0o660);
    drop(listener);
    Ok(())
}

#[tokio::test]
async fn stale_socket_node_is_replaced() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let state = state_with_socket(&dir);

    // A leftover node from a crashed process must not block startup.
    std::fs::write(&state.identity.socket_path, b"stale")?;
    let listener = setup_socket(&state)?;
    drop(listener);
    Ok(())
}

#[tokio::test]
async fn missing_socket_directory_is_created() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut identity = crate::test_support::identity("sess-sup", "s3cret");
    identity.socket_path = dir.path().join("nested/deeper/bridge.sock");
    let state = BridgeState::new(identity);

    let listener = setup_socket(&state)?;
    assert!(state.identity.socket_path.exists());
    drop(listener);
    Ok(())
}

#[tokio::test]
#[serial_test::serial(registry)]
async fn serves_framed_requests_and_cleans_up_on_shutdown() -> anyhow::Result<()> {
    crate::registry::unregister_all();
    crate::handlers::register_builtins()?;

    let dir = tempfile::tempdir()?;
    let state = state_with_socket(&dir);
    let listener = setup_socket(&state)?;
    let socket_path = state.identity.socket_path.clone();

    let supervisor = tokio::spawn(run(Arc::clone(&state), listener));

    let mut conn = tokio::net::UnixStream::connect(&socket_path).await?;
    let request = authed_request(&state.identity, "control", "ping", &[]);
    send_request(&mut conn, &request).await?;
    let response = read_response(&mut conn).await?;
    assert_eq!(response.status, Status::Ok);

    state.closing.cancel();
    tokio::time::timeout(Duration::from_secs(2), supervisor).await???;
    assert!(!socket_path.exists(), "socket must be removed on graceful shutdown");
    crate::registry::unregister_all();
    Ok(())
}

#[tokio::test]
#[serial_test::serial(registry)]
async fn shutdown_rpc_stops_the_bridge() -> anyhow::Result<()> {
    crate::registry::unregister_all();
    crate::handlers::register_builtins()?;

    let dir = tempfile::tempdir()?;
    let state = state_with_socket(&dir);
    let listener = setup_socket(&state)?;

    let supervisor = tokio::spawn(run(Arc::clone(&state), listener));

    let mut conn = tokio::net::UnixStream::connect(&state.identity.socket_path).await?;
    let request = authed_request(&state.identity, "control", "shutdown", &[]);
    send_request(&mut conn, &request).await?;
    let response = read_response(&mut conn).await?;
    assert_eq!(response.status, Status::Ok, "shutdown acks before the bridge exits");

    tokio::time::timeout(Duration::from_secs(2), supervisor).await???;
    crate::registry::unregister_all();
    Ok(())
}
