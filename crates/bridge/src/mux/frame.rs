// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Multiplexer wire format.
//!
//! Every mux frame leads with the 0x00 discriminator so mux traffic is
//! distinguishable from control-plane (0x01–0x03), legacy JSON (`{`), and
//! data-plane (0x80–0x8F) bytes on the same socket:
//!
//! `[0x00][cmd:1][stream_id:4 BE][len:4 BE][payload]`

use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// First byte of every multiplexer frame.
pub const MUX_DISCRIMINATOR: u8 = 0x00;

/// Frame payloads cap at the per-stream window.
pub const MAX_MUX_PAYLOAD: usize = 16 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MuxCmd {
    /// Open a stream. `stream_id` is assigned by the opener.
    Syn = 0x01,
    /// Stream data; consumes send-window credit.
    Data = 0x02,
    /// Replenish send-window credit; payload is a 4-byte BE count.
    Window = 0x03,
    /// Half-close: no more data in this direction.
    Fin = 0x04,
    /// Abortive close of both directions.
    Rst = 0x05,
    /// Keepalive; `stream_id` carries the ping sequence number.
    Ping = 0x06,
    Pong = 0x07,
    /// Session-level graceful close: no new streams.
    GoAway = 0x08,
}

impl MuxCmd {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Syn),
            0x02 => Some(Self::Data),
            0x03 => Some(Self::Window),
            0x04 => Some(Self::Fin),
            0x05 => Some(Self::Rst),
            0x06 => Some(Self::Ping),
            0x07 => Some(Self::Pong),
            0x08 => Some(Self::GoAway),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxFrame {
    pub cmd: MuxCmd,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl MuxFrame {
    pub fn syn(stream_id: u32) -> Self {
        Self { cmd: MuxCmd::Syn, stream_id, payload: Bytes::new() }
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self { cmd: MuxCmd::Data, stream_id, payload }
    }

    pub fn window(stream_id: u32, credit: u32) -> Self {
        Self {
            cmd: MuxCmd::Window,
            stream_id,
            payload: Bytes::copy_from_slice(&credit.to_be_bytes()),
        }
    }

    pub fn fin(stream_id: u32) -> Self {
        Self { cmd: MuxCmd::Fin, stream_id, payload: Bytes::new() }
    }

    pub fn rst(stream_id: u32) -> Self {
        Self { cmd: MuxCmd::Rst, stream_id, payload: Bytes::new() }
    }

    pub fn ping(seq: u32) -> Self {
        Self { cmd: MuxCmd::Ping, stream_id: seq, payload: Bytes::new() }
    }

    pub fn pong(seq: u32) -> Self {
        Self { cmd: MuxCmd::Pong, stream_id: seq, payload: Bytes::new() }
    }

    pub fn goaway() -> Self {
        Self { cmd: MuxCmd::GoAway, stream_id: 0, payload: Bytes::new() }
    }

    /// Decode a Window payload into its credit count.
    pub fn window_credit(&self) -> io::Result<u32> {
        let p: &[u8] = &self.payload;
        let bytes: [u8; 4] = p
            .try_into()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "window payload must be 4 bytes"))?;
        Ok(u32::from_be_bytes(bytes))
    }
}

/// Read one mux frame. Returns `Ok(None)` on clean EOF at a frame boundary.
pub async fn read_mux_frame<R>(r: &mut R) -> io::Result<Option<MuxFrame>>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    if r.read(&mut first).await? == 0 {
        return Ok(None);
    }
    if first[0] != MUX_DISCRIMINATOR {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected mux discriminator, got 0x{:02x}", first[0]),
        ));
    }
    let cmd = r.read_u8().await?;
    let cmd = MuxCmd::from_u8(cmd).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, format!("unknown mux command 0x{cmd:02x}"))
    })?;
    let stream_id = r.read_u32().await?;
    let len = r.read_u32().await? as usize;
    if len > MAX_MUX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("mux frame payload {len} exceeds {MAX_MUX_PAYLOAD} bytes"),
        ));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(Some(MuxFrame { cmd, stream_id, payload: Bytes::from(payload) }))
}

/// Write one mux frame as a single contiguous buffer.
pub async fn write_mux_frame<W>(w: &mut W, frame: &MuxFrame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(10 + frame.payload.len());
    buf.push(MUX_DISCRIMINATOR);
    buf.push(frame.cmd as u8);
    buf.extend_from_slice(&frame.stream_id.to_be_bytes());
    buf.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    w.write_all(&buf).await?;
    w.flush().await
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
