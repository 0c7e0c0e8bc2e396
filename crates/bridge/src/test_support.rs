// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: identity builders and wire-level client
//! helpers used by unit tests and the integration specs.

use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bootstrap::SessionIdentity;
use crate::proto::frame::{
    encode_open, read_frame, write_control, write_stream, Frame, Opcode, StreamFrame, MSG_JSON,
};
use crate::proto::request::{Request, Response};

/// A session identity with fixed test credentials.
pub fn identity(session_id: &str, secret: &str) -> SessionIdentity {
    SessionIdentity {
        session_id: session_id.to_owned(),
        username: "tester".to_owned(),
        uid: 1000,
        gid: 1000,
        socket_path: PathBuf::from("/tmp/linuxio-bridge-test.sock"),
        secret: secret.to_owned(),
        server_base_url: None,
        server_cert: None,
    }
}

/// A request carrying valid credentials for `identity`.
pub fn authed_request(
    identity: &SessionIdentity,
    namespace: &str,
    command: &str,
    args: &[&str],
) -> Request {
    Request {
        namespace: namespace.to_owned(),
        command: command.to_owned(),
        args: args.iter().map(|a| (*a).to_owned()).collect(),
        secret: identity.secret.clone(),
        session_id: identity.session_id.clone(),
    }
}

/// Send one framed Pattern-A request.
pub async fn send_request<W>(w: &mut W, request: &Request) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(request)?;
    write_control(w, MSG_JSON, &payload).await?;
    Ok(())
}

/// Read one framed Pattern-A response.
pub async fn read_response<R>(r: &mut R) -> anyhow::Result<Response>
where
    R: AsyncRead + Unpin,
{
    match read_frame(r).await? {
        Some(Frame::Control(frame)) => Ok(serde_json::from_slice(&frame.payload)?),
        other => anyhow::bail!("expected a control frame, got {other:?}"),
    }
}

/// Send the Open frame that starts a Pattern-B stream.
pub async fn send_open<W>(
    w: &mut W,
    stream_id: u32,
    stream_type: &str,
    args: &[&str],
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let args: Vec<String> = args.iter().map(|a| (*a).to_owned()).collect();
    let payload = encode_open(stream_type, &args);
    write_stream(w, Opcode::Open, stream_id, &payload).await?;
    Ok(())
}

/// Read the next data-plane frame, skipping nothing.
pub async fn read_stream_frame<R>(r: &mut R) -> anyhow::Result<StreamFrame>
where
    R: AsyncRead + Unpin,
{
    match read_frame(r).await? {
        Some(Frame::Stream(frame)) => Ok(frame),
        other => anyhow::bail!("expected a stream frame, got {other:?}"),
    }
}

/// Drain a Pattern-B stream until its Result frame, collecting Data bytes
/// and Progress payloads along the way. Returns `(data, progress, result)`.
pub async fn collect_stream<R>(
    r: &mut R,
) -> anyhow::Result<(Vec<u8>, Vec<serde_json::Value>, serde_json::Value)>
where
    R: AsyncRead + Unpin,
{
    let mut data = Vec::new();
    let mut progress = Vec::new();
    loop {
        let frame = read_stream_frame(r).await?;
        match frame.opcode {
            Opcode::Data => data.extend_from_slice(&frame.payload),
            Opcode::Progress => progress.push(serde_json::from_slice(&frame.payload)?),
            Opcode::Result => {
                let result = serde_json::from_slice(&frame.payload)?;
                return Ok((data, progress, result));
            }
            Opcode::Close => anyhow::bail!("Close before Result"),
            other => anyhow::bail!("unexpected opcode {other:?}"),
        }
    }
}

/// After the Result, the dispatcher closes the stream.
pub async fn expect_close<R>(r: &mut R) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let frame = read_stream_frame(r).await?;
    if frame.opcode != Opcode::Close {
        anyhow::bail!("expected Close, got {:?}", frame.opcode);
    }
    Ok(())
}

/// Write one upload Data chunk.
pub async fn send_data<W>(w: &mut W, stream_id: u32, chunk: &[u8]) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_stream(w, Opcode::Data, stream_id, chunk).await?;
    Ok(())
}

/// Request cancellation of an in-flight stream.
pub async fn send_abort<W>(w: &mut W, stream_id: u32) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_stream(w, Opcode::Abort, stream_id, &[]).await?;
    Ok(())
}

/// Gracefully end the client side of a stream.
pub async fn send_close<W>(w: &mut W, stream_id: u32) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_stream(w, Opcode::Close, stream_id, &[]).await?;
    w.flush().await?;
    Ok(())
}

/// Extension trait to convert any `Display` error into `anyhow::Error`.
pub trait AnyhowExt<T> {
    fn anyhow(self) -> anyhow::Result<T>;
}

impl<T, E: std::fmt::Display> AnyhowExt<T> for Result<T, E> {
    fn anyhow(self) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{e}"))
    }
}
