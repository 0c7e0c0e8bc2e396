// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end bridge specs over real unix sockets: framed RPC, legacy
//! ingress, multiplexed streams, abort, and graceful shutdown.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use bridge::mux::{MuxSession, Role};
use bridge::proto::request::Status;
use bridge::test_support::{
    collect_stream, expect_close, read_response, send_abort, send_data, send_open, send_request,
};
use linuxio_specs::start_bridge;

#[tokio::test]
async fn happy_path_rpc() -> anyhow::Result<()> {
    let bridge = start_bridge().await?;
    let mut conn = bridge.connect().await?;

    send_request(&mut conn, &bridge.request("control", "ping", &[])).await?;
    let response = read_response(&mut conn).await?;
    assert_eq!(response.status, Status::Ok);
    assert_eq!(
        response.output.ok_or_else(|| anyhow::anyhow!("no output"))?["type"],
        "pong"
    );

    bridge.stop().await?;
    Ok(())
}

#[tokio::test]
async fn auth_mismatch_closes_the_connection() -> anyhow::Result<()> {
    let bridge = start_bridge().await?;
    let mut conn = bridge.connect().await?;

    let mut request = bridge.request("control", "ping", &[]);
    request.secret = "wrong".to_owned();
    send_request(&mut conn, &request).await?;

    let response = read_response(&mut conn).await?;
    assert_eq!(response.status, Status::Error);
    assert_eq!(response.error.as_deref(), Some("invalid secret"));

    // The bridge hangs up on hostile callers: next read is EOF.
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), conn.read(&mut buf)).await??;
    assert_eq!(n, 0, "connection must be closed after an auth failure");

    bridge.stop().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_command_leaves_the_connection_usable() -> anyhow::Result<()> {
    let bridge = start_bridge().await?;
    let mut conn = bridge.connect().await?;

    send_request(&mut conn, &bridge.request("control", "does-not-exist", &[])).await?;
    let response = read_response(&mut conn).await?;
    assert_eq!(response.error.as_deref(), Some("unknown command: does-not-exist"));

    // Same framed connection, valid request: still served.
    send_request(&mut conn, &bridge.request("control", "ping", &[])).await?;
    let response = read_response(&mut conn).await?;
    assert_eq!(response.status, Status::Ok);

    bridge.stop().await?;
    Ok(())
}

#[tokio::test]
async fn legacy_line_delimited_json_still_works() -> anyhow::Result<()> {
    let bridge = start_bridge().await?;
    let mut conn = bridge.connect().await?;

    let line = serde_json::to_string(&bridge.request("control", "ping", &[]))?;
    conn.write_all(line.as_bytes()).await?;
    conn.write_all(b"\n").await?;

    let mut reader = BufReader::new(&mut conn);
    let mut reply = String::new();
    reader.read_line(&mut reply).await?;
    let response: serde_json::Value = serde_json::from_str(&reply)?;
    assert_eq!(response["status"], "ok");
    assert_eq!(response["output"]["type"], "pong");

    bridge.stop().await?;
    Ok(())
}

#[tokio::test]
async fn download_stream_over_the_multiplexer() -> anyhow::Result<()> {
    let bridge = start_bridge().await?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("file-of-1500000-bytes");
    let content: Vec<u8> = (0..1_500_000u32).map(|i| (i % 256) as u8).collect();
    std::fs::write(&path, &content)?;

    let conn = bridge.connect().await?;
    let session = MuxSession::new(conn, Role::Client);
    let mut stream = session.open().await?;

    let sid = stream.id();
    send_open(&mut stream, sid, "fb-download", &[&path.to_string_lossy()]).await?;

    let (data, progress, result) = collect_stream(&mut stream).await?;
    assert_eq!(data, content, "bytes observed on the stream equal the file bytes");
    assert!(!progress.is_empty(), "at least one Progress frame before the Result");
    assert!(progress.iter().any(|p| p["total"] == 1_500_000));
    assert_eq!(result["status"], "ok");
    assert_eq!(result["data"]["size"], 1_500_000);
    assert_eq!(result["data"]["fileName"], "file-of-1500000-bytes");
    expect_close(&mut stream).await?;

    bridge.stop().await?;
    Ok(())
}

#[tokio::test]
async fn upload_abort_terminates_quickly_and_cleans_up() -> anyhow::Result<()> {
    let bridge = start_bridge().await?;

    let dir = tempfile::tempdir()?;
    let dst = dir.path().join("dst");

    let conn = bridge.connect().await?;
    let session = MuxSession::new(conn, Role::Client);
    let mut stream = session.open().await?;

    let sid = stream.id();
    send_open(&mut stream, sid, "fb-upload", &[&dst.to_string_lossy(), "10485760"]).await?;
    let chunk = vec![9u8; 1 << 20];
    send_data(&mut stream, sid, &chunk).await?;
    stream.flush().await?;
    send_abort(&mut stream, sid).await?;

    let collected = tokio::time::timeout(Duration::from_secs(1), collect_stream(&mut stream)).await;
    let (_, _, result) =
        collected.map_err(|_| anyhow::anyhow!("no terminal frame within 1s of Abort"))??;
    assert_eq!(result["status"], "error");
    assert_eq!(result["code"], 499);
    expect_close(&mut stream).await?;

    // Partial cleanup: destination absent or zero bytes.
    tokio::time::sleep(Duration::from_millis(100)).await;
    match std::fs::metadata(&dst) {
        Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
        Ok(meta) => assert_eq!(meta.len(), 0),
    }

    bridge.stop().await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_rpc_exits_cleanly() -> anyhow::Result<()> {
    let bridge = start_bridge().await?;
    let socket_path = bridge.socket_path.clone();
    let mut conn = bridge.connect().await?;

    send_request(&mut conn, &bridge.request("control", "shutdown", &[])).await?;
    let response = read_response(&mut conn).await?;
    assert_eq!(response.status, Status::Ok);

    bridge.wait_exit().await?;
    assert!(!socket_path.exists(), "socket removed on exit");
    Ok(())
}

#[tokio::test]
async fn graceful_shutdown_under_load() -> anyhow::Result<()> {
    let bridge = start_bridge().await?;
    let socket_path = bridge.socket_path.clone();

    let conn = bridge.connect().await?;
    let session = MuxSession::new(conn, Role::Client);

    // Two long-running streams that emit progress every 100 ms.
    let mut streams = Vec::new();
    for _ in 0..2 {
        let mut stream = session.open().await?;
        let sid = stream.id();
        send_open(&mut stream, sid, "spec-slow", &[]).await?;
        streams.push(stream);
    }

    // See at least one progress frame on each before pulling the plug.
    for stream in &mut streams {
        let frame = bridge::test_support::read_stream_frame(stream).await?;
        assert_eq!(frame.opcode, bridge::proto::frame::Opcode::Progress);
    }

    // SIGTERM's handler does exactly this latch.
    bridge.state.closing.cancel();

    for mut stream in streams {
        let terminal = tokio::time::timeout(Duration::from_secs(6), async {
            loop {
                let frame = bridge::test_support::read_stream_frame(&mut stream).await?;
                if frame.opcode == bridge::proto::frame::Opcode::Result {
                    return anyhow::Ok(serde_json::from_slice::<serde_json::Value>(
                        &frame.payload,
                    )?);
                }
            }
        })
        .await??;
        assert_eq!(terminal["error"], "canceled: bridge shutting down");
    }

    bridge.stop().await?;
    assert!(!socket_path.exists(), "socket removed after drain");
    Ok(())
}
