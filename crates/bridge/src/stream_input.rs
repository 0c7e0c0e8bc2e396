// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Inbound side of a Pattern-B invocation: the Data and Resize frames the
//! client writes while the handler runs.

use bytes::Bytes;
use tokio::sync::mpsc;

/// A client-originated frame delivered to a stream handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A raw Data chunk (uploads, terminal input).
    Data(Bytes),
    /// A terminal geometry change.
    Resize { cols: u16, rows: u16 },
}

/// Receiving handle for inbound frames, owned by the handler invocation.
pub struct StreamInput {
    rx: mpsc::Receiver<InboundEvent>,
}

impl StreamInput {
    /// Create a connected sender/receiver pair.
    pub fn channel(capacity: usize) -> (mpsc::Sender<InboundEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }

    /// Next inbound event. `None` once the client half-closed the stream
    /// (Close frame or EOF) and the queue drained.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        self.rx.recv().await
    }
}
