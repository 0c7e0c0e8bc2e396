// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection intake and per-stream dispatch.
//!
//! Every accepted connection is classified by its first byte: multiplexed
//! session (0x00), legacy line-delimited JSON (`{`), framed single-shot
//! control (0x01–0x03), or a direct data-plane stream (0x80–0x8F). Each
//! logical stream then runs one Pattern A (request/response) or Pattern B
//! (open-data-close) exchange.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::bootstrap::SessionIdentity;
use crate::error::ErrorCode;
use crate::events::Events;
use crate::mux::frame::MUX_DISCRIMINATOR;
use crate::mux::{MuxSession, Role};
use crate::proto::frame::{
    decode_open, decode_resize, is_control_frame, is_stream_frame, read_control_body, read_frame,
    write_control, Frame, Opcode, StreamFrame, LEGACY_JSON_START, MSG_JSON,
};
use crate::proto::request::{Refusal, Request, Response};
use crate::registry::{self, HandlerCtx};
use crate::stream_input::{InboundEvent, StreamInput};

/// How long an aborted handler gets to observe its context and clean up
/// before the dispatcher force-aborts it.
const ABORT_CLEANUP: std::time::Duration = std::time::Duration::from_millis(500);

/// Queue depth between the inbound monitor and a stream handler.
const INPUT_QUEUE: usize = 128;

/// Shared dispatch state for one bridge process.
pub struct BridgeState {
    pub identity: Arc<SessionIdentity>,
    /// Latched once shutdown begins; every dispatch selects on it.
    pub closing: CancellationToken,
    /// Wait-group for in-flight streams.
    pub tracker: TaskTracker,
}

impl BridgeState {
    pub fn new(identity: SessionIdentity) -> Arc<Self> {
        Arc::new(Self {
            identity: Arc::new(identity),
            closing: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    fn handler_ctx(&self, cancel: CancellationToken) -> HandlerCtx {
        HandlerCtx {
            cancel,
            identity: Arc::clone(&self.identity),
            shutdown: self.closing.clone(),
        }
    }
}

/// `AsyncRead + AsyncWrite` adapter that replays one already-consumed byte
/// before delegating, so a sub-protocol reader sees the full byte stream
/// after the dispatcher's one-byte peek.
pub struct PeekedIo<S> {
    prefix: Option<u8>,
    io: S,
}

impl<S> PeekedIo<S> {
    pub fn new(io: S, prefix: u8) -> Self {
        Self { prefix: Some(prefix), io }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedIo<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if let Some(byte) = self.prefix.take() {
            buf.put_slice(&[byte]);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedIo<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Classify and serve one accepted connection until it closes.
pub async fn serve_connection<S>(mut conn: S, state: Arc<BridgeState>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let first = tokio::select! {
        byte = conn.read_u8() => match byte {
            Ok(b) => b,
            Err(_) => return,
        },
        _ = state.closing.cancelled() => return,
    };

    match first {
        MUX_DISCRIMINATOR => serve_mux(PeekedIo::new(conn, first), state).await,
        LEGACY_JSON_START => legacy_loop(PeekedIo::new(conn, first), state).await,
        b if is_control_frame(b) => framed_loop(conn, b, state).await,
        b if is_stream_frame(b) => dispatch_stream(PeekedIo::new(conn, b), state).await,
        b => {
            warn!("unrecognized first byte 0x{b:02x}, dropping connection");
        }
    }
}

/// Multiplexed mode: accept logical streams until the peer disconnects or
/// shutdown begins. In-flight streams keep the session tasks alive after
/// this returns, so terminal frames still reach the peer during the drain
/// grace.
async fn serve_mux<S>(io: S, state: Arc<BridgeState>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let session = MuxSession::new(io, Role::Server);
    loop {
        tokio::select! {
            stream = session.accept() => match stream {
                Some(stream) => {
                    let state = Arc::clone(&state);
                    state.tracker.clone().spawn(async move {
                        dispatch_stream(stream, state).await;
                    });
                }
                None => break,
            },
            _ = state.closing.cancelled() => break,
        }
    }
}

/// Dispatch one logical stream: the first frame selects Pattern A or B.
pub async fn dispatch_stream<S>(stream: S, state: Arc<BridgeState>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut rd, mut wr) = tokio::io::split(stream);

    let first = tokio::select! {
        byte = rd.read_u8() => match byte {
            Ok(b) => b,
            Err(_) => return,
        },
        _ = state.closing.cancelled() => return,
    };

    if is_control_frame(first) {
        // Pattern A over a dedicated stream: one request, one response.
        let frame = match read_control_body(&mut rd, first).await {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "bad control frame on stream");
                return;
            }
        };
        let (response, _) = handle_control_payload(&frame.payload, &state).await;
        write_response(&mut wr, &response).await;
        return;
    }

    if first == Opcode::Open as u8 {
        let open = match crate::proto::frame::read_stream_body(&mut rd, first).await {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "bad open frame on stream");
                return;
            }
        };
        run_pattern_b(open, rd, wr, state).await;
        return;
    }

    debug!("stream did not start with a request or Open (first byte 0x{first:02x})");
}

/// Parse and execute one Pattern-A request payload.
///
/// The bool result is "close the connection": true for auth-class refusals,
/// false otherwise.
async fn handle_control_payload(payload: &[u8], state: &Arc<BridgeState>) -> (Response, bool) {
    let request: Request = match serde_json::from_slice(payload) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "malformed request JSON");
            return (Response::err("invalid request"), true);
        }
    };
    handle_request(request, state).await
}

/// Validate, route, and run a Pattern-A request.
pub async fn handle_request(request: Request, state: &Arc<BridgeState>) -> (Response, bool) {
    if let Err(refusal) = request.validate(&state.identity) {
        info!(
            namespace = %request.namespace,
            command = %request.command,
            reason = refusal.message(),
            "request refused"
        );
        let close = matches!(refusal, Refusal::Auth(_));
        return (Response::err(refusal.message()), close);
    }

    let Some(handler) = registry::lookup(&request.namespace, &request.command) else {
        // Stream types only exist on the data plane; a request/response
        // connection cannot run them.
        let message = if registry::lookup_stream(&request.command).is_some() {
            format!("streaming not supported on this connection: {}", request.command)
        } else if registry::has_namespace(&request.namespace) {
            format!("unknown command: {}", request.command)
        } else {
            format!("unknown type: {}", request.namespace)
        };
        return (Response::err(message), false);
    };

    let ctx = state.handler_ctx(state.closing.child_token());
    let namespace = request.namespace.clone();
    let command = request.command.clone();
    let args = request.args;
    let mut task = tokio::spawn(async move { handler.handle(ctx, args).await });

    tokio::select! {
        // Biased so a handler that finished concurrently with shutdown
        // still gets its real response out.
        biased;
        result = &mut task => match result {
            Ok(Ok(output)) => (Response::ok(output), false),
            Ok(Err(e)) => {
                error!(%namespace, %command, error = %e, "handler failed");
                (Response::err(e.message), false)
            }
            Err(join) => (Response::err(join_failure(&namespace, &command, join)), false),
        },
        _ = state.closing.cancelled() => {
            task.abort();
            (Response::err("canceled: bridge shutting down"), true)
        }
    }
}

/// Convert a task join failure (panic or external abort) into a response
/// message, logging panics at error severity.
fn join_failure(namespace: &str, command: &str, join: JoinError) -> String {
    if join.is_panic() {
        let message = panic_message(join);
        error!(%namespace, %command, panic = %message, "handler panicked");
        format!("panic: {message}")
    } else {
        "handler canceled".to_owned()
    }
}

fn panic_message(join: JoinError) -> String {
    let payload = join.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

async fn write_response<W: AsyncWrite + Unpin>(wr: &mut W, response: &Response) {
    let payload = match serde_json::to_vec(response) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "encode response");
            return;
        }
    };
    if let Err(e) = write_control(wr, MSG_JSON, &payload).await {
        debug!(error = %e, "write response");
    }
}

/// How a Pattern-B invocation ended.
enum StreamOutcome {
    Done(Result<Result<(), crate::error::HandlerError>, JoinError>),
    Aborted,
    Closing,
}

/// Run a Pattern-B (open-data-close) invocation to its terminal frames.
async fn run_pattern_b<R, W>(open: StreamFrame, rd: R, wr: W, state: Arc<BridgeState>)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let stream_id = open.stream_id;
    let events = Events::new(stream_id, Box::new(wr));

    let (stream_type, args) = match decode_open(&open.payload) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(stream_id, error = %e, "bad Open payload");
            let _ = events.error("invalid open frame", ErrorCode::BadRequest).await;
            let _ = events.close(None).await;
            return;
        }
    };

    let Some(handler) = registry::lookup_stream(&stream_type) else {
        let _ = events
            .error(&format!("unknown stream type: {stream_type}"), ErrorCode::NotFound)
            .await;
        let _ = events.close(None).await;
        return;
    };

    debug!(stream_id, %stream_type, "stream opened");

    // The invocation token is a child of bridge_closing and additionally
    // cancelled by the abort monitor, so handlers observe both through one
    // context.
    let invocation = state.closing.child_token();
    let (input_tx, input) = StreamInput::channel(INPUT_QUEUE);
    let monitor = tokio::spawn(inbound_monitor(rd, input_tx, invocation.clone()));

    let ctx = state.handler_ctx(invocation.clone());
    let handler_events = events.clone();
    let mut task =
        tokio::spawn(async move { handler.handle(ctx, args, input, handler_events).await });

    let outcome = tokio::select! {
        biased;
        result = &mut task => StreamOutcome::Done(result),
        _ = invocation.cancelled() => {
            if state.closing.is_cancelled() {
                StreamOutcome::Closing
            } else {
                StreamOutcome::Aborted
            }
        }
    };

    match outcome {
        StreamOutcome::Done(Ok(Ok(()))) => {
            if !events.result_emitted() {
                let _ = events.result(&Value::Null).await;
            }
        }
        StreamOutcome::Done(Ok(Err(e))) => {
            if events.result_emitted() {
                // The handler already produced its terminal frame; the error
                // is informational only.
                warn!(stream_id, %stream_type, error = %e, "handler error after result");
            } else {
                error!(stream_id, %stream_type, error = %e, "stream handler failed");
                let _ = events.error(&e.message, e.code).await;
            }
        }
        StreamOutcome::Done(Err(join)) => {
            let message = join_failure(&stream_type, "stream", join);
            if !events.result_emitted() {
                let _ = events.error(&message, ErrorCode::Internal).await;
            }
        }
        StreamOutcome::Aborted => {
            // Short cleanup window for handlers that observe their context,
            // then the terminal frame goes out regardless.
            let _ = tokio::time::timeout(ABORT_CLEANUP, &mut task).await;
            task.abort();
            if !events.result_emitted() {
                let _ = events.error("operation aborted", ErrorCode::Aborted).await;
            }
        }
        StreamOutcome::Closing => {
            task.abort();
            if !events.result_emitted() {
                let _ = events.error("canceled: bridge shutting down", ErrorCode::Canceled).await;
            }
        }
    }

    let _ = events.close(None).await;
    monitor.abort();
    debug!(stream_id, %stream_type, "stream closed");
}

/// Watch the client side of a Pattern-B stream: forward Data/Resize to the
/// handler, latch cancellation on Abort, and keep draining until the
/// dispatcher's own Close.
async fn inbound_monitor<R>(
    mut rd: R,
    input_tx: tokio::sync::mpsc::Sender<InboundEvent>,
    invocation: CancellationToken,
) where
    R: AsyncRead + Send + Unpin,
{
    loop {
        let frame = match read_frame(&mut rd).await {
            Ok(Some(Frame::Stream(f))) => f,
            Ok(Some(Frame::Control(_))) => {
                debug!("control frame on a data-plane stream, ignoring");
                continue;
            }
            Ok(None) | Err(_) => break,
        };
        match frame.opcode {
            Opcode::Data => {
                // A send failure means the handler is gone; keep draining so
                // the client's writes never back up against a dead reader.
                let _ = input_tx.send(InboundEvent::Data(frame.payload)).await;
            }
            Opcode::Resize => match decode_resize(&frame.payload) {
                Ok((cols, rows)) => {
                    let _ = input_tx.send(InboundEvent::Resize { cols, rows }).await;
                }
                Err(e) => debug!(error = %e, "bad resize payload"),
            },
            Opcode::Abort => {
                debug!(stream_id = frame.stream_id, "abort requested");
                invocation.cancel();
            }
            Opcode::Close => break,
            other => {
                debug!(opcode = ?other, "unexpected client opcode on stream");
            }
        }
    }
}

/// Legacy ingress: line-delimited JSON requests on the raw socket.
/// Pattern A only; one JSON object per line.
async fn legacy_loop<S>(io: S, state: Arc<BridgeState>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (rd, mut wr) = tokio::io::split(io);
    let mut lines = BufReader::new(rd).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => break,
            },
            _ = state.closing.cancelled() => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let (response, close) = handle_control_payload(line.as_bytes(), &state).await;
        if write_legacy_response(&mut wr, &response).await.is_err() || close {
            break;
        }
    }
}

async fn write_legacy_response<W: AsyncWrite + Unpin>(
    wr: &mut W,
    response: &Response,
) -> std::io::Result<()> {
    let mut payload = serde_json::to_vec(response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    payload.push(b'\n');
    wr.write_all(&payload).await?;
    wr.flush().await
}

/// Framed single-shot mode: length-prefixed control frames on the raw
/// socket, no multiplexer. Loops so a client can issue several requests on
/// one connection.
async fn framed_loop<S>(io: S, first: u8, state: Arc<BridgeState>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut rd, mut wr) = tokio::io::split(io);
    let mut pending = Some(first);

    loop {
        let msg_type = match pending.take() {
            Some(b) => b,
            None => {
                tokio::select! {
                    byte = rd.read_u8() => match byte {
                        Ok(b) => b,
                        Err(_) => break,
                    },
                    _ = state.closing.cancelled() => break,
                }
            }
        };

        if !is_control_frame(msg_type) {
            write_response(&mut wr, &Response::err("invalid message type")).await;
            break;
        }
        let frame = match read_control_body(&mut rd, msg_type).await {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "bad control frame");
                write_response(&mut wr, &Response::err("invalid frame")).await;
                break;
            }
        };
        if msg_type != MSG_JSON {
            write_response(&mut wr, &Response::err("unsupported message type")).await;
            continue;
        }

        let (response, close) = handle_control_payload(&frame.payload, &state).await;
        write_response(&mut wr, &response).await;
        if close {
            break;
        }
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
