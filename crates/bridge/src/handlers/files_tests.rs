// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::{dispatch_stream, BridgeState};
use crate::registry;
use crate::test_support::{
    collect_stream, expect_close, identity, send_abort, send_close, send_data, send_open,
};

fn test_state() -> Arc<BridgeState> {
    BridgeState::new(identity("sess-files", "s3cret"))
}

fn ensure_file_handlers() -> anyhow::Result<()> {
    if registry::lookup_stream("fb-download").is_none() {
        super::register()?;
    }
    Ok(())
}

fn dispatch_pair(state: &Arc<BridgeState>) -> tokio::io::DuplexStream {
    let (client, server) = tokio::io::duplex(1 << 21);
    let state = Arc::clone(state);
    tokio::spawn(async move {
        dispatch_stream(server, state).await;
    });
    client
}

#[tokio::test]
#[serial_test::serial(registry)]
async fn download_streams_bytes_progress_then_result() -> anyhow::Result<()> {
    registry::unregister_all();
    ensure_file_handlers()?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("file-of-1500000-bytes");
    let content: Vec<u8> = (0..1_500_000u32).map(|i| (i % 256) as u8).collect();
    std::fs::write(&path, &content)?;

    let state = test_state();
    let mut client = dispatch_pair(&state);
    send_open(&mut client, 1, "fb-download", &[&path.to_string_lossy()]).await?;

    let (data, progress, result) = collect_stream(&mut client).await?;
    assert_eq!(data, content, "bytes on the stream equal the file bytes");
    assert!(!progress.is_empty(), "at least one progress frame before the result");
    assert_eq!(progress[0]["total"], 1_500_000);
    assert_eq!(result["status"], "ok");
    assert_eq!(result["data"]["size"], 1_500_000);
    assert_eq!(result["data"]["fileName"], "file-of-1500000-bytes");
    expect_close(&mut client).await?;
    registry::unregister_all();
    Ok(())
}

#[tokio::test]
#[serial_test::serial(registry)]
async fn download_of_missing_file_reports_not_found() -> anyhow::Result<()> {
    registry::unregister_all();
    ensure_file_handlers()?;

    let state = test_state();
    let mut client = dispatch_pair(&state);
    send_open(&mut client, 1, "fb-download", &["/nonexistent/nowhere.bin"]).await?;

    let (_, _, result) = collect_stream(&mut client).await?;
    assert_eq!(result["status"], "error");
    assert_eq!(result["code"], 404);
    expect_close(&mut client).await?;
    registry::unregister_all();
    Ok(())
}

#[tokio::test]
#[serial_test::serial(registry)]
async fn upload_writes_the_destination_and_acks_progress() -> anyhow::Result<()> {
    registry::unregister_all();
    ensure_file_handlers()?;

    let dir = tempfile::tempdir()?;
    let dst = dir.path().join("upload.bin");
    let total: usize = 2 << 20;

    let state = test_state();
    let mut client = dispatch_pair(&state);
    send_open(&mut client, 5, "fb-upload", &[&dst.to_string_lossy(), &total.to_string()]).await?;

    let chunk = vec![7u8; 256 * 1024];
    for _ in 0..(total / chunk.len()) {
        send_data(&mut client, 5, &chunk).await?;
    }
    send_close(&mut client, 5).await?;

    let (_, progress, result) = collect_stream(&mut client).await?;
    assert_eq!(result["status"], "ok");
    assert_eq!(result["data"]["size"], total);
    // 512 KiB interval over 2 MiB: several ACK frames, monotone offsets.
    assert!(progress.len() >= 2, "upload progress acts as an ACK stream");
    let offsets: Vec<u64> =
        progress.iter().filter_map(|p| p["bytes"].as_u64()).collect();
    assert!(offsets.windows(2).all(|w| w[0] <= w[1]), "offsets are monotone");
    expect_close(&mut client).await?;

    assert_eq!(std::fs::read(&dst)?.len(), total);
    registry::unregister_all();
    Ok(())
}

#[tokio::test]
#[serial_test::serial(registry)]
async fn aborted_upload_leaves_no_partial_file() -> anyhow::Result<()> {
    registry::unregister_all();
    ensure_file_handlers()?;

    let dir = tempfile::tempdir()?;
    let dst = dir.path().join("aborted.bin");

    let state = test_state();
    let mut client = dispatch_pair(&state);
    send_open(&mut client, 6, "fb-upload", &[&dst.to_string_lossy(), "10485760"]).await?;
    let chunk = vec![1u8; 1 << 20];
    send_data(&mut client, 6, &chunk).await?;
    send_abort(&mut client, 6).await?;

    let collected =
        tokio::time::timeout(Duration::from_secs(1), collect_stream(&mut client)).await;
    let (_, _, result) =
        collected.map_err(|_| anyhow::anyhow!("no terminal frame within 1s of Abort"))??;
    assert_eq!(result["status"], "error");
    assert_eq!(result["code"], 499);
    expect_close(&mut client).await?;

    // Give the cleanup a moment, then the destination must be gone or empty.
    tokio::time::sleep(Duration::from_millis(100)).await;
    match std::fs::metadata(&dst) {
        Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
        Ok(meta) => assert_eq!(meta.len(), 0, "partial upload must not survive"),
    }
    registry::unregister_all();
    Ok(())
}

#[tokio::test]
#[serial_test::serial(registry)]
async fn short_upload_is_an_error_and_cleaned_up() -> anyhow::Result<()> {
    registry::unregister_all();
    ensure_file_handlers()?;

    let dir = tempfile::tempdir()?;
    let dst = dir.path().join("short.bin");

    let state = test_state();
    let mut client = dispatch_pair(&state);
    send_open(&mut client, 7, "fb-upload", &[&dst.to_string_lossy(), "1000000"]).await?;
    send_data(&mut client, 7, &[2u8; 1000]).await?;
    send_close(&mut client, 7).await?;

    let (_, _, result) = collect_stream(&mut client).await?;
    assert_eq!(result["status"], "error");
    let error = result["error"].as_str().unwrap_or_default();
    assert!(error.contains("upload incomplete"), "got: {error}");
    expect_close(&mut client).await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!dst.exists());
    registry::unregister_all();
    Ok(())
}
