// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A pure-Rust BEEP (RFC 3080/3081) framing and session runtime: frame
//! codec (C1), the multiplexed [`Channel`](channel::Channel) (C5) with
//! its sequencer/window (C7), the per-connection reader loop (C6), the
//! channel-0 management dialect (C10), a profile registry (C8), the
//! two-phase listener (C9), the tuning reset manager (C11) and a
//! client-facing [`Session`](session::Session) on top of it all.

pub mod cfg;
pub mod channel;
pub mod concurrency;
pub mod connection;
pub mod context;
pub mod error;
pub mod frame;
pub mod greeting;
pub mod io;
pub mod listener;
pub mod profile;
pub mod reader;
pub mod session;
pub mod tuning;
