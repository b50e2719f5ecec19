// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Channel 0 management: the greeting exchange and the `<start>`/
//! `<close>` request handlers (C10).

pub mod handshake;
pub mod xml;

pub use handshake::{exchange_greetings, handle_one_channel_zero_request};
pub use xml::{ChannelZeroMsg, ProfileAd};
