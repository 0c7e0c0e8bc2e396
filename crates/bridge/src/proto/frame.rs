// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire framing for the bridge socket.
//!
//! Two frame shapes share one byte stream, discriminated by the first byte:
//!
//! | First byte | Meaning |
//! |---|---|
//! | 0x00       | multiplexer frame (see `crate::mux`) |
//! | 0x01–0x03  | control-plane frame: `[type:1][len:4 BE][payload]` |
//! | 0x7B (`{`) | legacy unframed JSON at connection start |
//! | 0x80–0x8F  | data-plane frame: `[opcode:1][stream_id:4 BE][len:4 BE][payload]` |

use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Control-plane message types (first byte of a control frame).
pub const MSG_JSON: u8 = 0x01;
pub const MSG_BINARY: u8 = 0x02;
pub const MSG_JSON_STREAM: u8 = 0x03;

/// First byte of a legacy unframed JSON request (`{`).
pub const LEGACY_JSON_START: u8 = 0x7B;

/// Control-plane frames cap at 1 GiB.
pub const MAX_CONTROL_PAYLOAD: usize = 1 << 30;
/// Data-plane frames cap at 16 MiB, aligned with the per-stream window.
pub const MAX_STREAM_PAYLOAD: usize = 16 << 20;

/// Data-plane opcodes. The 0x80–0x8F range is reserved for stream frames;
/// the high bit keeps them disjoint from control types and ASCII `{`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Open = 0x80,
    Data = 0x81,
    Close = 0x82,
    Resize = 0x83,
    Progress = 0x84,
    Result = 0x85,
    Abort = 0x86,
}

impl Opcode {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x80 => Some(Self::Open),
            0x81 => Some(Self::Data),
            0x82 => Some(Self::Close),
            0x83 => Some(Self::Resize),
            0x84 => Some(Self::Progress),
            0x85 => Some(Self::Result),
            0x86 => Some(Self::Abort),
            _ => None,
        }
    }
}

/// Whether a first byte falls in the data-plane opcode range.
pub fn is_stream_frame(b: u8) -> bool {
    (0x80..=0x8F).contains(&b)
}

/// Whether a first byte is a control-plane message type.
pub fn is_control_frame(b: u8) -> bool {
    (MSG_JSON..=MSG_JSON_STREAM).contains(&b)
}

/// A control-plane frame: message type plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub msg_type: u8,
    pub payload: Bytes,
}

/// A data-plane frame: opcode, stream id, opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub opcode: Opcode,
    pub stream_id: u32,
    pub payload: Bytes,
}

fn oversize(kind: &str, len: usize, max: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{kind} frame payload {len} exceeds {max} bytes"),
    )
}

/// Read the body of a control frame whose type byte was already consumed.
pub async fn read_control_body<R>(r: &mut R, msg_type: u8) -> io::Result<ControlFrame>
where
    R: AsyncRead + Unpin,
{
    if !is_control_frame(msg_type) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid control message type 0x{msg_type:02x}"),
        ));
    }
    let len = r.read_u32().await? as usize;
    if len > MAX_CONTROL_PAYLOAD {
        return Err(oversize("control", len, MAX_CONTROL_PAYLOAD));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(ControlFrame { msg_type, payload: Bytes::from(payload) })
}

/// Read the body of a stream frame whose opcode byte was already consumed.
pub async fn read_stream_body<R>(r: &mut R, opcode: u8) -> io::Result<StreamFrame>
where
    R: AsyncRead + Unpin,
{
    let opcode = Opcode::from_u8(opcode).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, format!("unknown stream opcode 0x{opcode:02x}"))
    })?;
    let stream_id = r.read_u32().await?;
    let len = r.read_u32().await? as usize;
    if len > MAX_STREAM_PAYLOAD {
        return Err(oversize("stream", len, MAX_STREAM_PAYLOAD));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(StreamFrame { opcode, stream_id, payload: Bytes::from(payload) })
}

/// Either frame shape, as read off the shared byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlFrame),
    Stream(StreamFrame),
}

/// Read one frame, consuming the discriminator byte first.
///
/// Returns `Ok(None)` on clean EOF at a frame boundary.
pub async fn read_frame<R>(r: &mut R) -> io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    if r.read(&mut first).await? == 0 {
        return Ok(None);
    }
    read_frame_after(r, first[0]).await.map(Some)
}

/// Read one frame whose first byte was already consumed by a peek.
pub async fn read_frame_after<R>(r: &mut R, first: u8) -> io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    if is_control_frame(first) {
        Ok(Frame::Control(read_control_body(r, first).await?))
    } else if is_stream_frame(first) {
        Ok(Frame::Stream(read_stream_body(r, first).await?))
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected frame discriminator 0x{first:02x}"),
        ))
    }
}

/// Write one control frame: `[type][len:4 BE][payload]`.
pub async fn write_control<W>(w: &mut W, msg_type: u8, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_CONTROL_PAYLOAD {
        return Err(oversize("control", payload.len(), MAX_CONTROL_PAYLOAD));
    }
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(msg_type);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    w.write_all(&buf).await?;
    w.flush().await
}

/// Write one stream frame: `[opcode][stream_id:4 BE][len:4 BE][payload]`.
pub async fn write_stream<W>(
    w: &mut W,
    opcode: Opcode,
    stream_id: u32,
    payload: &[u8],
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_STREAM_PAYLOAD {
        return Err(oversize("stream", payload.len(), MAX_STREAM_PAYLOAD));
    }
    let mut buf = Vec::with_capacity(9 + payload.len());
    buf.push(opcode as u8);
    buf.extend_from_slice(&stream_id.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    w.write_all(&buf).await?;
    w.flush().await
}

/// Encode an Open payload: `streamType\0arg1\0arg2\0…`.
pub fn encode_open(stream_type: &str, args: &[String]) -> Bytes {
    let mut buf = Vec::with_capacity(
        stream_type.len() + args.iter().map(|a| a.len() + 1).sum::<usize>(),
    );
    buf.extend_from_slice(stream_type.as_bytes());
    for arg in args {
        buf.push(0);
        buf.extend_from_slice(arg.as_bytes());
    }
    Bytes::from(buf)
}

/// Decode an Open payload into `(stream_type, args)`.
pub fn decode_open(payload: &[u8]) -> io::Result<(String, Vec<String>)> {
    let mut parts = payload.split(|b| *b == 0);
    let stream_type = parts
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty stream type in Open"))?;
    let stream_type = String::from_utf8(stream_type.to_vec())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 stream type"))?;
    let args = parts
        .map(|p| {
            String::from_utf8(p.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 Open argument"))
        })
        .collect::<io::Result<Vec<String>>>()?;
    Ok((stream_type, args))
}

/// Encode a Resize payload: `[cols:2 BE][rows:2 BE]`.
pub fn encode_resize(cols: u16, rows: u16) -> Bytes {
    let mut buf = Vec::with_capacity(4);
    buf.extend_from_slice(&cols.to_be_bytes());
    buf.extend_from_slice(&rows.to_be_bytes());
    Bytes::from(buf)
}

/// Decode a Resize payload into `(cols, rows)`.
pub fn decode_resize(payload: &[u8]) -> io::Result<(u16, u16)> {
    if payload.len() != 4 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "resize payload must be 4 bytes"));
    }
    let cols = u16::from_be_bytes([payload[0], payload[1]]);
    let rows = u16::from_be_bytes([payload[2], payload[3]]);
    Ok((cols, rows))
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
