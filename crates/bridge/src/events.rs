// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-invocation emission capability handed to stream handlers.
//!
//! All emits serialize through the stream's writer lock and succeed or fail
//! whole frames; once the stream is closed every further emit fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCode, HandlerError};
use crate::proto::frame::{write_stream, Opcode};
use crate::proto::request::ResultPayload;

type FrameWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct EventsInner {
    stream_id: u32,
    writer: Mutex<FrameWriter>,
    closed: AtomicBool,
    result_sent: AtomicBool,
}

/// Capability for emitting Data / Progress / Result / Close frames on one
/// logical stream. Cheap to clone; all clones share the writer lock and
/// close state.
#[derive(Clone)]
pub struct Events {
    inner: Arc<EventsInner>,
}

impl Events {
    pub fn new(stream_id: u32, writer: FrameWriter) -> Self {
        Self {
            inner: Arc::new(EventsInner {
                stream_id,
                writer: Mutex::new(writer),
                closed: AtomicBool::new(false),
                result_sent: AtomicBool::new(false),
            }),
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.inner.stream_id
    }

    /// Whether a terminal Result frame has been emitted on this stream.
    pub fn result_emitted(&self) -> bool {
        self.inner.result_sent.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    async fn emit(&self, opcode: Opcode, payload: &[u8]) -> Result<(), HandlerError> {
        let mut writer = self.inner.writer.lock().await;
        // Checked under the lock so an emit never races a concurrent close.
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(HandlerError::internal("stream closed"));
        }
        if let Err(e) = write_stream(&mut *writer, opcode, self.inner.stream_id, payload).await {
            self.inner.closed.store(true, Ordering::Release);
            return Err(HandlerError::internal(format!("stream write: {e}")));
        }
        Ok(())
    }

    /// Emit a raw Data chunk.
    pub async fn data(&self, chunk: &[u8]) -> Result<(), HandlerError> {
        self.emit(Opcode::Data, chunk).await
    }

    /// Emit a Progress frame carrying `obj` as JSON. Does not close the
    /// stream.
    pub async fn progress<T: Serialize>(&self, obj: &T) -> Result<(), HandlerError> {
        let payload = serde_json::to_vec(obj)?;
        self.emit(Opcode::Progress, &payload).await
    }

    /// Emit the terminal `Result{status: ok, data}` frame. Does not itself
    /// close the stream; the dispatcher closes on handler return.
    pub async fn result<T: Serialize>(&self, data: &T) -> Result<(), HandlerError> {
        let payload = serde_json::to_vec(&ResultPayload::ok(serde_json::to_value(data)?))?;
        self.emit(Opcode::Result, &payload).await?;
        self.inner.result_sent.store(true, Ordering::Release);
        Ok(())
    }

    /// Emit `Result{status: error, error, code}`. Does not close the stream,
    /// so handlers may report several failures before finishing.
    pub async fn error(&self, message: &str, code: ErrorCode) -> Result<(), HandlerError> {
        let payload = serde_json::to_vec(&ResultPayload::err(message, code))?;
        self.emit(Opcode::Result, &payload).await?;
        self.inner.result_sent.store(true, Ordering::Release);
        Ok(())
    }

    /// Emit the Close frame; every subsequent emit fails.
    pub async fn close(&self, reason: Option<&[u8]>) -> Result<(), HandlerError> {
        let mut writer = self.inner.writer.lock().await;
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(HandlerError::internal("stream closed"));
        }
        write_stream(&mut *writer, Opcode::Close, self.inner.stream_id, reason.unwrap_or(&[]))
            .await
            .map_err(|e| HandlerError::internal(format!("stream write: {e}")))
    }
}

/// Throttled progress reporting over an [`Events`] handle.
///
/// Emits a frame only when at least `interval` bytes were processed since
/// the last report, or processing reached `total`. Zero or negative totals
/// emit nothing. Single producer per tracker.
pub struct ProgressTracker {
    events: Events,
    cancel: CancellationToken,
    interval: u64,
    last_reported: u64,
}

impl ProgressTracker {
    pub fn new(events: Events, cancel: CancellationToken, interval: u64) -> Self {
        Self { events, cancel, interval, last_reported: 0 }
    }

    /// Report `processed` of `total` bytes, emitting a
    /// `{bytes, total, pct, phase?}` Progress frame when due.
    ///
    /// Observes cancellation before each write: once the invocation is
    /// aborted the next due report fails with `aborted`.
    pub async fn report(
        &mut self,
        processed: u64,
        total: i64,
        phase: Option<&str>,
    ) -> Result<(), HandlerError> {
        if total <= 0 {
            return Ok(());
        }
        let done = processed >= total as u64;
        if processed.saturating_sub(self.last_reported) < self.interval && !done {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(HandlerError::aborted());
        }
        let pct = ((processed as f64 / total as f64) * 100.0).min(100.0);
        let mut obj = serde_json::json!({
            "bytes": processed,
            "total": total,
            "pct": pct,
        });
        if let (Some(map), Some(phase)) = (obj.as_object_mut(), phase) {
            map.insert("phase".to_owned(), serde_json::Value::String(phase.to_owned()));
        }
        self.events.progress(&obj).await?;
        self.last_reported = processed;
        Ok(())
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
