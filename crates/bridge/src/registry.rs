// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide handler registry.
//!
//! Populated during bridge startup, read-only once the accept loop begins.
//! Two tables: `(namespace, command)` for control-plane commands and
//! `stream_type` for data-plane stream handlers. Encapsulated behind
//! register/lookup/unregister — the maps are never exposed.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::SessionIdentity;
use crate::error::HandlerError;
use crate::events::Events;
use crate::stream_input::StreamInput;

/// Context passed to every handler invocation.
#[derive(Clone)]
pub struct HandlerCtx {
    /// Cancelled on stream Abort and on bridge shutdown. Handlers observe
    /// this between suspension points.
    pub cancel: CancellationToken,
    /// The immutable session identity captured at bootstrap.
    pub identity: Arc<SessionIdentity>,
    /// Latching this requests bridge shutdown (used by `control/shutdown`).
    pub shutdown: CancellationToken,
}

/// A Pattern-A (request/response) handler.
pub trait CommandHandler: Send + Sync {
    fn handle(
        &self,
        ctx: HandlerCtx,
        args: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;
}

/// A Pattern-B (open-data-close) handler.
pub trait StreamHandler: Send + Sync {
    fn handle(
        &self,
        ctx: HandlerCtx,
        args: Vec<String>,
        input: StreamInput,
        events: Events,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;
}

impl<F, Fut> CommandHandler for F
where
    F: Fn(HandlerCtx, Vec<String>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    fn handle(
        &self,
        ctx: HandlerCtx,
        args: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>> {
        Box::pin(self(ctx, args))
    }
}

impl<F, Fut> StreamHandler for F
where
    F: Fn(HandlerCtx, Vec<String>, StreamInput, Events) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(
        &self,
        ctx: HandlerCtx,
        args: Vec<String>,
        input: StreamInput,
        events: Events,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>> {
        Box::pin(self(ctx, args, input, events))
    }
}

type CommandMap = BTreeMap<(String, String), Arc<dyn CommandHandler>>;
type StreamMap = BTreeMap<String, Arc<dyn StreamHandler>>;

static COMMANDS: RwLock<CommandMap> = RwLock::new(BTreeMap::new());
static STREAMS: RwLock<StreamMap> = RwLock::new(BTreeMap::new());

/// Register a command handler under `(namespace, command)`.
///
/// Rejects empty keys and duplicates — a second registration for the same
/// key never silently overwrites the first.
pub fn register(
    namespace: &str,
    command: &str,
    handler: Arc<dyn CommandHandler>,
) -> anyhow::Result<()> {
    if namespace.is_empty() || command.is_empty() {
        anyhow::bail!("handler registration requires a non-empty namespace and command");
    }
    let key = (namespace.to_owned(), command.to_owned());
    let mut commands = COMMANDS.write();
    if commands.contains_key(&key) {
        anyhow::bail!("handler already registered: {namespace}/{command}");
    }
    commands.insert(key, handler);
    Ok(())
}

/// Register a stream handler under `stream_type`.
pub fn register_stream(stream_type: &str, handler: Arc<dyn StreamHandler>) -> anyhow::Result<()> {
    if stream_type.is_empty() {
        anyhow::bail!("stream handler registration requires a non-empty stream type");
    }
    let mut streams = STREAMS.write();
    if streams.contains_key(stream_type) {
        anyhow::bail!("stream handler already registered: {stream_type}");
    }
    streams.insert(stream_type.to_owned(), handler);
    Ok(())
}

pub fn lookup(namespace: &str, command: &str) -> Option<Arc<dyn CommandHandler>> {
    COMMANDS.read().get(&(namespace.to_owned(), command.to_owned())).map(Arc::clone)
}

pub fn lookup_stream(stream_type: &str) -> Option<Arc<dyn StreamHandler>> {
    STREAMS.read().get(stream_type).map(Arc::clone)
}

/// Whether any command is registered under `namespace`. Lets the dispatcher
/// distinguish "unknown type" from "unknown command".
pub fn has_namespace(namespace: &str) -> bool {
    COMMANDS.read().keys().any(|(ns, _)| ns == namespace)
}

/// Remove one command handler. Test-only in spirit: call before the accept
/// loop starts.
pub fn unregister(namespace: &str, command: &str) -> bool {
    COMMANDS.write().remove(&(namespace.to_owned(), command.to_owned())).is_some()
}

pub fn unregister_stream(stream_type: &str) -> bool {
    STREAMS.write().remove(stream_type).is_some()
}

/// Clear both tables. For test isolation only.
pub fn unregister_all() {
    COMMANDS.write().clear();
    STREAMS.write().clear();
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
