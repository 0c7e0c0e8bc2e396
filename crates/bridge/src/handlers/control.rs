// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `control` namespace: liveness, version, and shutdown.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::HandlerError;
use crate::registry::{self, HandlerCtx};

pub fn register() -> anyhow::Result<()> {
    registry::register("control", "ping", Arc::new(ping))?;
    registry::register("control", "version", Arc::new(version))?;
    registry::register("control", "shutdown", Arc::new(shutdown))?;
    Ok(())
}

async fn ping(_ctx: HandlerCtx, _args: Vec<String>) -> Result<Value, HandlerError> {
    Ok(json!({"type": "pong"}))
}

async fn version(_ctx: HandlerCtx, _args: Vec<String>) -> Result<Value, HandlerError> {
    Ok(json!({
        "name": "linuxio-bridge",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Requests bridge shutdown. The dispatcher's completion-biased select gets
/// the ok response out before the accept loop observes the latch.
async fn shutdown(ctx: HandlerCtx, _args: Vec<String>) -> Result<Value, HandlerError> {
    ctx.shutdown.cancel();
    Ok(json!({"shutdown": true}))
}

#[cfg(test)]
#[path = "control_tests.rs"]
mod tests;
