// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Built-in handlers. Everything here is a thin consumer of the IPC
//! substrate: the registry, dispatcher, events, and progress plumbing do
//! the heavy lifting.

pub mod control;
pub mod files;

/// Register every built-in handler. Called once during bridge startup,
/// before the accept loop.
pub fn register_builtins() -> anyhow::Result<()> {
    control::register()?;
    files::register()?;
    Ok(())
}
