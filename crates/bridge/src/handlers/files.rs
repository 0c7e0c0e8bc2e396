// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File transfer streams: `fb-download` (bridge→client Data) and
//! `fb-upload` (client→bridge Data with progress as the upload ACK).

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::HandlerError;
use crate::events::{Events, ProgressTracker};
use crate::registry::{self, HandlerCtx};
use crate::stream_input::{InboundEvent, StreamInput};

const DOWNLOAD_CHUNK: usize = 256 * 1024;
/// Downloads report sparingly; the client is just displaying a bar.
const DOWNLOAD_PROGRESS_INTERVAL: u64 = 2 << 20;
/// Uploads report often; the client sizes its next chunk against the last
/// acknowledged offset.
const UPLOAD_PROGRESS_INTERVAL: u64 = 512 << 10;

pub fn register() -> anyhow::Result<()> {
    registry::register_stream("fb-download", Arc::new(download))?;
    registry::register_stream("fb-upload", Arc::new(upload))?;
    Ok(())
}

/// Stream a file to the client: Data chunks, throttled Progress, then
/// `Result{path, size, fileName}`.
async fn download(
    ctx: HandlerCtx,
    args: Vec<String>,
    _input: StreamInput,
    events: Events,
) -> Result<(), HandlerError> {
    let path = args.first().ok_or_else(|| HandlerError::bad_request("missing path argument"))?;
    let mut file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    let file_name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut tracker =
        ProgressTracker::new(events.clone(), ctx.cancel.clone(), DOWNLOAD_PROGRESS_INTERVAL);
    let mut buf = vec![0u8; DOWNLOAD_CHUNK];
    let mut sent: u64 = 0;
    loop {
        if ctx.cancel.is_cancelled() {
            return Err(HandlerError::aborted());
        }
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        events.data(&buf[..n]).await?;
        sent += n as u64;
        tracker.report(sent, size as i64, None).await?;
    }

    events
        .result(&json!({
            "path": path,
            "size": size,
            "fileName": file_name,
        }))
        .await?;
    Ok(())
}

/// Receive a file from the client. On abort or failure the destination is
/// removed so no partial file survives.
async fn upload(
    ctx: HandlerCtx,
    args: Vec<String>,
    input: StreamInput,
    events: Events,
) -> Result<(), HandlerError> {
    let path =
        args.first().cloned().ok_or_else(|| HandlerError::bad_request("missing path argument"))?;
    let expected: i64 = match args.get(1) {
        Some(raw) => raw
            .parse()
            .map_err(|_| HandlerError::bad_request(format!("invalid size argument: {raw}")))?,
        None => -1,
    };

    let result = receive(&ctx, &path, expected, input, &events).await;
    match result {
        Ok(written) => {
            events.result(&json!({ "path": path, "size": written })).await?;
            Ok(())
        }
        Err(e) => {
            // Partial cleanup: the destination is either absent or complete,
            // never a torso.
            let _ = tokio::fs::remove_file(&path).await;
            Err(e)
        }
    }
}

async fn receive(
    ctx: &HandlerCtx,
    path: &str,
    expected: i64,
    mut input: StreamInput,
    events: &Events,
) -> Result<u64, HandlerError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut tracker =
        ProgressTracker::new(events.clone(), ctx.cancel.clone(), UPLOAD_PROGRESS_INTERVAL);
    let mut written: u64 = 0;

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(HandlerError::aborted());
            }
            event = input.recv() => match event {
                Some(InboundEvent::Data(chunk)) => {
                    file.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                    tracker.report(written, expected, None).await?;
                    if expected > 0 && written >= expected as u64 {
                        break;
                    }
                }
                Some(InboundEvent::Resize { .. }) => {}
                None => break,
            }
        }
    }
    file.flush().await?;

    if expected > 0 && written != expected as u64 {
        return Err(HandlerError::bad_request(format!(
            "upload incomplete: got {written} of {expected} bytes"
        )));
    }
    Ok(written)
}

#[cfg(test)]
#[path = "files_tests.rs"]
mod tests;
