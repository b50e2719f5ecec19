// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The Connection (C4): one transport (TCP, or whatever a tuning
//! reset has swapped it for) carrying zero or more channels.

#![allow(clippy::module_inception)]
pub mod conn;

pub use conn::{Connection, ConnId, ConnStatus};
