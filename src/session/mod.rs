// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client-facing session API: a thin ergonomic wrapper over
//! [`crate::context::Context`] and [`crate::connection::conn::Connection`].

pub mod session;

pub use session::{BlockingSession, Session};
