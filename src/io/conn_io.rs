// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The polymorphic I/O capability a connection reads and writes
//! through. Plain TCP is the only implementation shipped by this
//! crate; a TLS tuning reset (§4.8) is expected to wrap the same
//! socket in a TLS stream supplied by a profile crate and hand back a
//! new boxed `ConnIo`, which the connection swaps in without the
//! reader/writer code ever needing to know the concrete transport.

use tokio::io::{AsyncRead, AsyncWrite};

/// Anything that can serve as the byte-stream half of a BEEP
/// connection after the initial TCP accept/connect.
pub trait ConnIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ConnIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A type-erased, owned I/O capability, boxed so it can be swapped out
/// wholesale during a tuning reset (§4.8) while other tasks hold only
/// a `Mutex`-guarded reference to the box. `Box<dyn ConnIo>` is `Unpin`
/// (boxing always is), so it satisfies `AsyncRead`/`AsyncWrite`
/// directly without an extra `Pin` wrapper.
pub type BoxedConnIo = Box<dyn ConnIo>;
