// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket relay specs: a tungstenite client speaks the browser framing
//! through a real axum server onto a real bridge socket.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use bridge::proto::frame::{Frame, Opcode};
use linuxio_specs::{start_bridge, TestBridge};
use server::relay::{decode_ws_frame, encode_ws_frame, FLAG_DATA, FLAG_FIN, FLAG_RST, FLAG_SYN};
use server::transport::{build_router, ServerState};

const TOKEN: &str = "spec-token";

/// Spin up bridge + relay server; returns the bridge and the ws URL base.
async fn start_stack() -> anyhow::Result<(TestBridge, String)> {
    let bridge = start_bridge().await?;

    let state = ServerState::new(Some(TOKEN.to_owned()));
    state.register_session(&bridge.state.identity.session_id, bridge.socket_path.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let router = build_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    Ok((bridge, format!("ws://{addr}/ws")))
}

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(url: &str) -> anyhow::Result<WsClient> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await?;
    Ok(ws)
}

async fn send_frame(
    ws: &mut WsClient,
    stream_id: u32,
    flags: u8,
    payload: &[u8],
) -> anyhow::Result<()> {
    ws.send(Message::Binary(encode_ws_frame(stream_id, flags, payload))).await?;
    Ok(())
}

/// Accumulate DATA payloads for `stream_id` until FIN; RST is an error.
async fn collect_until_fin(ws: &mut WsClient, stream_id: u32) -> anyhow::Result<Vec<u8>> {
    let mut acc = Vec::new();
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("websocket closed early"))??;
        let Message::Binary(data) = msg else { continue };
        let frame = decode_ws_frame(&data)?;
        if frame.stream_id != stream_id {
            continue;
        }
        if frame.flags & FLAG_DATA != 0 {
            acc.extend_from_slice(&frame.payload);
        }
        if frame.flags & FLAG_FIN != 0 {
            return Ok(acc);
        }
        if frame.flags & FLAG_RST != 0 {
            anyhow::bail!("stream {stream_id} was reset");
        }
    }
}

/// Parse every bridge frame out of a relayed byte stream.
async fn parse_frames(bytes: &[u8]) -> anyhow::Result<Vec<Frame>> {
    let mut cursor = bytes;
    let mut frames = Vec::new();
    while let Some(frame) = bridge::proto::frame::read_frame(&mut cursor).await? {
        frames.push(frame);
    }
    Ok(frames)
}

#[tokio::test]
async fn pattern_a_rpc_through_the_relay() -> anyhow::Result<()> {
    let (bridge, url) = start_stack().await?;
    let mut ws = connect(&format!(
        "{url}?token={TOKEN}&session={}",
        bridge.state.identity.session_id
    ))
    .await?;

    // SYN carries the framed request verbatim; then FIN half-closes so the
    // bridge can answer.
    let request = bridge.request("control", "ping", &[]);
    let mut payload = Vec::new();
    bridge::test_support::send_request(&mut payload, &request).await?;
    send_frame(&mut ws, 1, FLAG_SYN, &payload).await?;
    send_frame(&mut ws, 1, FLAG_FIN, &[]).await?;

    let reply = collect_until_fin(&mut ws, 1).await?;
    let frames = parse_frames(&reply).await?;
    let Some(Frame::Control(frame)) = frames.first() else {
        anyhow::bail!("expected a control frame, got {frames:?}");
    };
    let response: serde_json::Value = serde_json::from_slice(&frame.payload)?;
    assert_eq!(response["status"], "ok");
    assert_eq!(response["output"]["type"], "pong");

    ws.close(None).await?;
    bridge.stop().await?;
    Ok(())
}

#[tokio::test]
async fn download_through_the_relay_is_byte_identical() -> anyhow::Result<()> {
    let (bridge, url) = start_stack().await?;
    let mut ws = connect(&format!(
        "{url}?token={TOKEN}&session={}",
        bridge.state.identity.session_id
    ))
    .await?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("relayed.bin");
    let content: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, &content)?;

    // The browser speaks the exact same stream-frame protocol it would use
    // over a direct socket; the relay never interprets it.
    let mut payload = Vec::new();
    bridge::test_support::send_open(&mut payload, 7, "fb-download", &[&path.to_string_lossy()])
        .await?;
    send_frame(&mut ws, 7, FLAG_SYN, &payload).await?;

    let reply = collect_until_fin(&mut ws, 7).await?;
    let frames = parse_frames(&reply).await?;

    let mut data = Vec::new();
    let mut result = None;
    let mut saw_close = false;
    for frame in &frames {
        if let Frame::Stream(f) = frame {
            match f.opcode {
                Opcode::Data => data.extend_from_slice(&f.payload),
                Opcode::Result => {
                    result = Some(serde_json::from_slice::<serde_json::Value>(&f.payload)?)
                }
                Opcode::Close => saw_close = true,
                _ => {}
            }
        }
    }
    assert_eq!(data, content);
    let result = result.ok_or_else(|| anyhow::anyhow!("no Result frame"))?;
    assert_eq!(result["data"]["size"], 300_000);
    assert!(saw_close, "bridge Close frame is relayed before FIN");

    ws.close(None).await?;
    bridge.stop().await?;
    Ok(())
}

#[tokio::test]
async fn wrong_token_is_rejected_at_upgrade() -> anyhow::Result<()> {
    let (bridge, url) = start_stack().await?;
    let result = connect(&format!(
        "{url}?token=wrong&session={}",
        bridge.state.identity.session_id
    ))
    .await;
    assert!(result.is_err(), "upgrade must fail with a bad token");
    bridge.stop().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_session_is_rejected_at_upgrade() -> anyhow::Result<()> {
    let (bridge, url) = start_stack().await?;
    let result = connect(&format!("{url}?token={TOKEN}&session=not-a-session")).await;
    assert!(result.is_err(), "upgrade must fail for an unknown session");
    bridge.stop().await?;
    Ok(())
}

#[tokio::test]
async fn rst_tears_down_one_stream_only() -> anyhow::Result<()> {
    let (bridge, url) = start_stack().await?;
    let mut ws = connect(&format!(
        "{url}?token={TOKEN}&session={}",
        bridge.state.identity.session_id
    ))
    .await?;

    // Stream 1: a long-running fixture we abort via RST.
    let mut open_slow = Vec::new();
    bridge::test_support::send_open(&mut open_slow, 1, "spec-slow", &[]).await?;
    send_frame(&mut ws, 1, FLAG_SYN, &open_slow).await?;
    send_frame(&mut ws, 1, FLAG_RST, &[]).await?;

    // Stream 2 on the same connection still works end-to-end.
    let request = bridge.request("control", "ping", &[]);
    let mut payload = Vec::new();
    bridge::test_support::send_request(&mut payload, &request).await?;
    send_frame(&mut ws, 2, FLAG_SYN, &payload).await?;
    send_frame(&mut ws, 2, FLAG_FIN, &[]).await?;

    let reply = collect_until_fin(&mut ws, 2).await?;
    let frames = parse_frames(&reply).await?;
    let Some(Frame::Control(frame)) = frames.first() else {
        anyhow::bail!("expected a control frame");
    };
    let response: serde_json::Value = serde_json::from_slice(&frame.payload)?;
    assert_eq!(response["status"], "ok");

    ws.close(None).await?;
    bridge.stop().await?;
    Ok(())
}
