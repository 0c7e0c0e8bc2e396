// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket↔bridge byte relay.
//!
//! Every WS binary message is `[stream_id:4 BE][flags:1][payload]`. The
//! relay maps each browser stream onto a multiplexer stream against the
//! bridge socket and shuttles bytes verbatim in both directions. Payloads
//! are never decoded here — all protocol meaning lives in the bridge and
//! the browser client.

use std::collections::HashMap;
use std::io;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use bridge::mux::{MuxSession, MuxStream, Role};

/// Open a new stream; payload is forwarded as the first bytes.
pub const FLAG_SYN: u8 = 0x01;
/// Stream data, forwarded verbatim.
pub const FLAG_DATA: u8 = 0x04;
/// Graceful end-of-write; the bridge's response may still follow.
pub const FLAG_FIN: u8 = 0x08;
/// Abortive teardown of the mapping.
pub const FLAG_RST: u8 = 0x10;

/// Chunk size for bridge→WS reads.
const RELAY_CHUNK: usize = 64 * 1024;

/// A decoded relay message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
    pub stream_id: u32,
    pub flags: u8,
    pub payload: Bytes,
}

/// Encode `[stream_id:4 BE][flags:1][payload]`.
pub fn encode_ws_frame(stream_id: u32, flags: u8, payload: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.extend_from_slice(&stream_id.to_be_bytes());
    buf.push(flags);
    buf.extend_from_slice(payload);
    Bytes::from(buf)
}

/// Decode a relay message; rejects anything shorter than its 5-byte header.
pub fn decode_ws_frame(data: &[u8]) -> io::Result<WsFrame> {
    if data.len() < 5 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("relay frame too short: {} bytes", data.len()),
        ));
    }
    let stream_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    Ok(WsFrame { stream_id, flags: data[4], payload: Bytes::copy_from_slice(&data[5..]) })
}

struct RelayedStream {
    /// `None` after FIN: the write direction is done but the bridge side may
    /// still be producing.
    writer: Option<WriteHalf<MuxStream>>,
    pump: JoinHandle<()>,
}

/// Relay one authenticated WebSocket connection against the bridge socket.
///
/// Returns when either side disconnects; all stream mappings are torn down
/// on exit.
pub async fn run_relay<T>(socket: WebSocket, bridge_io: T)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let session = MuxSession::new(bridge_io, Role::Client);
    let (ws_sink, mut ws_rx) = socket.split();

    // Pump tasks can't share the sink, so WS writes funnel through one
    // writer task.
    let (ws_tx, ws_out_rx) = mpsc::channel::<Message>(64);
    let writer = tokio::spawn(ws_writer(ws_sink, ws_out_rx));

    let mut streams: HashMap<u32, RelayedStream> = HashMap::new();

    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if handle_ws_frame(&data, &session, &mut streams, &ws_tx).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // text/ping/pong carry no relay meaning
                Some(Err(e)) => {
                    debug!(error = %e, "websocket read error");
                    break;
                }
            },
            _ = session.closed() => {
                debug!("bridge session closed, ending relay");
                break;
            }
        }
    }

    for (_, stream) in streams.drain() {
        stream.pump.abort();
    }
    session.close().await;
    writer.abort();
}

/// Route one inbound WS frame. An error means the connection is beyond
/// recovery (bridge unreachable).
async fn handle_ws_frame(
    data: &[u8],
    session: &MuxSession,
    streams: &mut HashMap<u32, RelayedStream>,
    ws_tx: &mpsc::Sender<Message>,
) -> Result<(), ()> {
    let frame = match decode_ws_frame(data) {
        Ok(f) => f,
        Err(e) => {
            debug!(error = %e, "malformed relay frame, dropping");
            return Ok(());
        }
    };
    let sid = frame.stream_id;

    if frame.flags & FLAG_SYN != 0 {
        if streams.contains_key(&sid) {
            warn!(stream_id = sid, "SYN for an id already mapped");
            send_rst(ws_tx, sid).await;
            return Ok(());
        }
        let stream = match session.open().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "bridge stream open failed");
                send_rst(ws_tx, sid).await;
                return Err(());
            }
        };
        let (rd, mut wr) = tokio::io::split(stream);
        if !frame.payload.is_empty() && wr.write_all(&frame.payload).await.is_err() {
            send_rst(ws_tx, sid).await;
            return Ok(());
        }
        let pump = tokio::spawn(bridge_to_ws(rd, sid, ws_tx.clone()));
        streams.insert(sid, RelayedStream { writer: Some(wr), pump });
        return Ok(());
    }

    if frame.flags & FLAG_DATA != 0 {
        let Some(stream) = streams.get_mut(&sid) else {
            send_rst(ws_tx, sid).await;
            return Ok(());
        };
        let Some(writer) = stream.writer.as_mut() else {
            debug!(stream_id = sid, "data after FIN, dropping");
            return Ok(());
        };
        if writer.write_all(&frame.payload).await.is_err() {
            send_rst(ws_tx, sid).await;
            if let Some(stream) = streams.remove(&sid) {
                stream.pump.abort();
            }
        }
        return Ok(());
    }

    if frame.flags & FLAG_FIN != 0 {
        // Forward the final payload (often the client's own Close frame),
        // then half-close; the pump keeps reading the bridge's response.
        if let Some(stream) = streams.get_mut(&sid) {
            if let Some(mut writer) = stream.writer.take() {
                if !frame.payload.is_empty() {
                    let _ = writer.write_all(&frame.payload).await;
                }
                let _ = writer.shutdown().await;
            }
        }
        return Ok(());
    }

    if frame.flags & FLAG_RST != 0 {
        if let Some(stream) = streams.remove(&sid) {
            stream.pump.abort();
        }
        return Ok(());
    }

    debug!(flags = frame.flags, "relay frame with no known flag, dropping");
    Ok(())
}

async fn send_rst(ws_tx: &mpsc::Sender<Message>, stream_id: u32) {
    let _ = ws_tx.send(Message::Binary(encode_ws_frame(stream_id, FLAG_RST, &[]))).await;
}

/// Copy bridge stream bytes back to the WebSocket: DATA per chunk, FIN on
/// EOF, RST on error.
async fn bridge_to_ws(mut rd: ReadHalf<MuxStream>, stream_id: u32, ws_tx: mpsc::Sender<Message>) {
    let mut buf = vec![0u8; RELAY_CHUNK];
    loop {
        match rd.read(&mut buf).await {
            Ok(0) => {
                let _ =
                    ws_tx.send(Message::Binary(encode_ws_frame(stream_id, FLAG_FIN, &[]))).await;
                return;
            }
            Ok(n) => {
                let frame = encode_ws_frame(stream_id, FLAG_DATA, &buf[..n]);
                if ws_tx.send(Message::Binary(frame)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(stream_id, error = %e, "bridge stream read error");
                let _ =
                    ws_tx.send(Message::Binary(encode_ws_frame(stream_id, FLAG_RST, &[]))).await;
                return;
            }
        }
    }
}

/// Drain the outbound queue into the WebSocket sink.
async fn ws_writer(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if sink.send(msg).await.is_err() {
            return;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
#[path = "relay_tests.rs"]
mod tests;
