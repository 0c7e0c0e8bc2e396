// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Symmetric stream multiplexer over one bidirectional byte stream.
//!
//! Either side may open streams; ids are opener-assigned with the dialer
//! using odd ids and the accepter even ids, so the two sides never collide.
//! Each stream gets a 16 MiB send window replenished by Window frames as the
//! receiver drains, a per-direction half-close (Fin), and an abortive Rst.
//! A single writer task serializes frames at the frame boundary; keepalive
//! pings detect dead peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::mux::frame::{read_mux_frame, write_mux_frame, MuxCmd, MuxFrame};
use crate::mux::stream::MuxStream;

/// Initial (and maximum outstanding) per-stream window.
pub const INITIAL_WINDOW: usize = 16 << 20;
/// Outbound data is cut into chunks of this size.
const CHUNK: usize = 256 * 1024;
/// Queue depth between the session reader and each stream's inbound pump.
const INBOUND_QUEUE: usize = 128;
/// Queue depth feeding the writer task.
const WIRE_QUEUE: usize = 64;
/// Keepalive cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Consecutive unanswered pings before the peer is declared dead.
const PING_MISS_LIMIT: u32 = 3;

/// Which side of the session this endpoint is; decides stream-id parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The dialing side; opens odd stream ids.
    Client,
    /// The accepting side; opens even stream ids.
    Server,
}

/// Events delivered from the session reader to a stream's inbound pump.
enum InEvent {
    Data(Bytes),
    Fin,
}

struct StreamEntry {
    inbound_tx: mpsc::Sender<InEvent>,
    credits: Arc<Semaphore>,
    cancel: CancellationToken,
    sent_fin: Arc<AtomicBool>,
    recv_fin: Arc<AtomicBool>,
}

struct Shared {
    wire_tx: mpsc::Sender<MuxFrame>,
    streams: parking_lot::Mutex<HashMap<u32, StreamEntry>>,
    accept_tx: mpsc::Sender<MuxStream>,
    next_id: AtomicU32,
    /// Latched by reader exit, keepalive expiry, or explicit close.
    shutdown: CancellationToken,
    /// Peer sent GoAway: no new streams may be opened.
    remote_goaway: AtomicBool,
    pong_seq: AtomicU32,
}

/// One multiplexed session over an underlying byte stream.
pub struct MuxSession {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
}

impl MuxSession {
    /// Start a session over `io`, spawning its reader/writer/keepalive tasks.
    pub fn new<T>(io: T, role: Role) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (rd, wr) = tokio::io::split(io);
        let (wire_tx, wire_rx) = mpsc::channel(WIRE_QUEUE);
        let (accept_tx, accept_rx) = mpsc::channel(32);
        let shutdown = CancellationToken::new();

        let shared = Arc::new(Shared {
            wire_tx,
            streams: parking_lot::Mutex::new(HashMap::new()),
            accept_tx,
            next_id: AtomicU32::new(match role {
                Role::Client => 1,
                Role::Server => 2,
            }),
            shutdown: shutdown.clone(),
            remote_goaway: AtomicBool::new(false),
            pong_seq: AtomicU32::new(0),
        });

        tokio::spawn(writer_task(wr, wire_rx, shutdown.clone()));
        tokio::spawn(reader_task(rd, Arc::clone(&shared)));
        tokio::spawn(keepalive_task(Arc::clone(&shared)));

        Self { shared, accept_rx: tokio::sync::Mutex::new(accept_rx) }
    }

    /// Open a new stream toward the peer.
    pub async fn open(&self) -> std::io::Result<MuxStream> {
        if self.shared.shutdown.is_cancelled() {
            return Err(closed_err("session closed"));
        }
        if self.shared.remote_goaway.load(Ordering::Acquire) {
            return Err(closed_err("peer is going away"));
        }
        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let stream = install_stream(&self.shared, id);
        self.shared
            .wire_tx
            .send(MuxFrame::syn(id))
            .await
            .map_err(|_| closed_err("session closed"))?;
        Ok(stream)
    }

    /// Wait for the next peer-opened stream. `None` once the session is done.
    pub async fn accept(&self) -> Option<MuxStream> {
        self.accept_rx.lock().await.recv().await
    }

    /// Graceful close: announce GoAway, then tear the session down. Frames
    /// already queued are flushed by the writer before it exits.
    pub async fn close(&self) {
        let _ = self.shared.wire_tx.send(MuxFrame::goaway()).await;
        self.shared.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Resolves when the session is torn down (peer death, reader EOF, or
    /// explicit close).
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await;
    }
}

fn closed_err(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, msg.to_owned())
}

/// Create the stream plumbing: a duplex pipe whose user half becomes the
/// [`MuxStream`] and whose session half is driven by two pump tasks.
fn install_stream(shared: &Arc<Shared>, id: u32) -> MuxStream {
    let (user_io, internal_io) = tokio::io::duplex(INITIAL_WINDOW);
    let (internal_rd, internal_wr) = tokio::io::split(internal_io);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let credits = Arc::new(Semaphore::new(INITIAL_WINDOW));
    let cancel = shared.shutdown.child_token();
    let sent_fin = Arc::new(AtomicBool::new(false));
    let recv_fin = Arc::new(AtomicBool::new(false));

    shared.streams.lock().insert(
        id,
        StreamEntry {
            inbound_tx,
            credits: Arc::clone(&credits),
            cancel: cancel.clone(),
            sent_fin: Arc::clone(&sent_fin),
            recv_fin: Arc::clone(&recv_fin),
        },
    );

    tokio::spawn(outbound_pump(
        Arc::clone(shared),
        id,
        internal_rd,
        credits,
        cancel.clone(),
        sent_fin,
    ));
    tokio::spawn(inbound_pump(Arc::clone(shared), id, internal_wr, inbound_rx, cancel, recv_fin));

    MuxStream::new(id, user_io)
}

impl Shared {
    /// Clone a stream's reader-facing handles out of the lock.
    fn entry_handles(&self, id: u32) -> Option<(mpsc::Sender<InEvent>, Arc<Semaphore>)> {
        let streams = self.streams.lock();
        streams.get(&id).map(|e| (e.inbound_tx.clone(), Arc::clone(&e.credits)))
    }

    /// Drop the entry once both directions have closed.
    fn remove_if_done(&self, id: u32) {
        let mut streams = self.streams.lock();
        if let Some(entry) = streams.get(&id) {
            if entry.sent_fin.load(Ordering::Acquire) && entry.recv_fin.load(Ordering::Acquire) {
                streams.remove(&id);
                trace!(stream_id = id, "stream retired");
            }
        }
    }

    /// Abortive teardown of one stream.
    fn reset(&self, id: u32, notify_peer: bool) {
        let entry = self.streams.lock().remove(&id);
        if let Some(entry) = entry {
            entry.cancel.cancel();
            if notify_peer {
                let _ = self.wire_tx.try_send(MuxFrame::rst(id));
            }
        }
    }
}

/// Drain user writes from the stream's pipe onto the wire, consuming
/// send-window credit per byte.
async fn outbound_pump(
    shared: Arc<Shared>,
    id: u32,
    mut rd: ReadHalf<tokio::io::DuplexStream>,
    credits: Arc<Semaphore>,
    cancel: CancellationToken,
    sent_fin: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = tokio::select! {
            r = rd.read(&mut buf) => match r {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            },
            _ = cancel.cancelled() => return,
        };
        let permit = tokio::select! {
            p = credits.acquire_many(n as u32) => match p {
                Ok(p) => p,
                Err(_) => return,
            },
            _ = cancel.cancelled() => return,
        };
        permit.forget();
        if shared.wire_tx.send(MuxFrame::data(id, Bytes::copy_from_slice(&buf[..n]))).await.is_err()
        {
            return;
        }
    }
    // User half-closed (or dropped) the write side: propagate Fin.
    sent_fin.store(true, Ordering::Release);
    let _ = shared.wire_tx.send(MuxFrame::fin(id)).await;
    shared.remove_if_done(id);
}

/// Deliver peer data into the stream's pipe, replenishing the peer's window
/// as bytes are accepted.
async fn inbound_pump(
    shared: Arc<Shared>,
    id: u32,
    mut wr: WriteHalf<tokio::io::DuplexStream>,
    mut inbound_rx: mpsc::Receiver<InEvent>,
    cancel: CancellationToken,
    recv_fin: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            ev = inbound_rx.recv() => match ev {
                Some(InEvent::Data(payload)) => {
                    if wr.write_all(&payload).await.is_err() {
                        // User dropped the read side; abort the stream.
                        shared.reset(id, true);
                        return;
                    }
                    let _ = shared
                        .wire_tx
                        .send(MuxFrame::window(id, payload.len() as u32))
                        .await;
                }
                Some(InEvent::Fin) | None => {
                    let _ = wr.shutdown().await;
                    break;
                }
            },
            _ = cancel.cancelled() => {
                let _ = wr.shutdown().await;
                return;
            }
        }
    }
    recv_fin.store(true, Ordering::Release);
    shared.remove_if_done(id);
}

/// Serialize every outbound frame. Single writer per connection: frames are
/// never interleaved mid-frame.
async fn writer_task<W>(
    mut wr: WriteHalf<W>,
    mut wire_rx: mpsc::Receiver<MuxFrame>,
    shutdown: CancellationToken,
) where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        tokio::select! {
            frame = wire_rx.recv() => match frame {
                Some(frame) => {
                    if write_mux_frame(&mut wr, &frame).await.is_err() {
                        shutdown.cancel();
                        return;
                    }
                }
                None => break,
            },
            _ = shutdown.cancelled() => {
                // Flush whatever was already queued, then stop.
                while let Ok(frame) = wire_rx.try_recv() {
                    if write_mux_frame(&mut wr, &frame).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    let _ = wr.shutdown().await;
}

/// Demultiplex inbound frames to their streams.
async fn reader_task<R>(mut rd: ReadHalf<R>, shared: Arc<Shared>)
where
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            f = read_mux_frame(&mut rd) => f,
            _ = shared.shutdown.cancelled() => break,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("mux peer closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "mux read error");
                break;
            }
        };

        match frame.cmd {
            MuxCmd::Syn => {
                let id = frame.stream_id;
                if shared.streams.lock().contains_key(&id) {
                    warn!(stream_id = id, "Syn for an id already in use");
                    let _ = shared.wire_tx.send(MuxFrame::rst(id)).await;
                    continue;
                }
                let stream = install_stream(&shared, id);
                if shared.accept_tx.send(stream).await.is_err() {
                    // Nobody accepting anymore; refuse the stream.
                    shared.reset(id, true);
                }
            }
            MuxCmd::Data => {
                let Some((inbound_tx, _)) = shared.entry_handles(frame.stream_id) else {
                    trace!(stream_id = frame.stream_id, "data for unknown stream");
                    continue;
                };
                if inbound_tx.send(InEvent::Data(frame.payload)).await.is_err() {
                    shared.reset(frame.stream_id, true);
                }
            }
            MuxCmd::Window => {
                if let Some((_, credits)) = shared.entry_handles(frame.stream_id) {
                    match frame.window_credit() {
                        Ok(credit) => {
                            // The window never exceeds its initial size: a
                            // peer can only ack bytes we actually sent.
                            let room =
                                INITIAL_WINDOW.saturating_sub(credits.available_permits());
                            credits.add_permits(room.min(credit as usize));
                        }
                        Err(e) => {
                            warn!(error = %e, "bad window frame");
                            break;
                        }
                    }
                }
            }
            MuxCmd::Fin => {
                if let Some((inbound_tx, _)) = shared.entry_handles(frame.stream_id) {
                    let _ = inbound_tx.send(InEvent::Fin).await;
                }
            }
            MuxCmd::Rst => {
                shared.reset(frame.stream_id, false);
            }
            MuxCmd::Ping => {
                let _ = shared.wire_tx.send(MuxFrame::pong(frame.stream_id)).await;
            }
            MuxCmd::Pong => {
                shared.pong_seq.store(frame.stream_id, Ordering::Release);
            }
            MuxCmd::GoAway => {
                shared.remote_goaway.store(true, Ordering::Release);
            }
        }
    }
    // Reader exit tears the whole session down.
    shared.shutdown.cancel();
}

/// Ping the peer and declare it dead after [`PING_MISS_LIMIT`] silent
/// intervals.
async fn keepalive_task(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    interval.tick().await; // first tick is immediate
    let mut seq = 0u32;
    let mut missed = 0u32;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shared.shutdown.cancelled() => return,
        }
        if seq > 0 && shared.pong_seq.load(Ordering::Acquire) < seq {
            missed += 1;
            if missed >= PING_MISS_LIMIT {
                warn!("mux peer missed {missed} keepalives, closing session");
                shared.shutdown.cancel();
                return;
            }
        } else {
            missed = 0;
        }
        seq += 1;
        if shared.wire_tx.send(MuxFrame::ping(seq)).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
