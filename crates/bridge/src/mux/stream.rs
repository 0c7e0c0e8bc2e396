// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User-facing handle for one multiplexed stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

/// An ordered, flow-controlled byte stream within a mux session.
///
/// Reads and writes are bridged to the session's pump tasks through an
/// in-process duplex pipe, so the handle is an ordinary `AsyncRead +
/// AsyncWrite` object: `shutdown` half-closes the write direction (the peer
/// sees EOF after in-flight data), dropping the handle tears the stream
/// down.
#[derive(Debug)]
pub struct MuxStream {
    id: u32,
    io: DuplexStream,
}

impl MuxStream {
    pub(crate) fn new(id: u32, io: DuplexStream) -> Self {
        Self { id, io }
    }

    /// The opener-assigned stream id.
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
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
