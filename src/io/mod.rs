// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The I/O waiter (C3): a timeout- and cancellation-aware wrapper
//! around transport reads/writes, plus the swappable read/write
//! capability a tuning reset hands a new implementation to.

pub mod conn_io;
pub mod waiter;

pub use conn_io::{BoxedConnIo, ConnIo};
pub use waiter::io_with_timeout;
