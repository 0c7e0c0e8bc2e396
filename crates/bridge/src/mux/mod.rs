// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-tree stream multiplexer.
//!
//! Higher layers (dispatcher, relay) depend only on the Open / Accept /
//! Read / Write / Close surface of [`session::MuxSession`] and
//! [`stream::MuxStream`]; nothing outside this module touches the mux wire
//! format.

pub mod frame;
pub mod session;
pub mod stream;

pub use session::{MuxSession, Role};
pub use stream::MuxStream;
