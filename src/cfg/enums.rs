// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Which readiness backend the reader loop (C3, C6) is built on.
///
/// Only `Tokio` is implemented; the enum exists so the config schema
/// and the Context constructor agree on a single extension point if a
/// second backend (e.g. an `io_uring`-based waiter) is added later.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoWaiterKind {
    #[serde(rename = "Tokio", alias = "tokio")]
    Tokio,
}

impl fmt::Display for IoWaiterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IoWaiterKind::Tokio => "Tokio",
        })
    }
}

/// Role a connection was established in, used to decide greeting
/// initiative (the listening side sends the first greeting).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    Initiating,
    Listening,
}

/// What a responder does when a `<close>` arrives for a channel that
/// still has outstanding local messages awaiting a reply (§4.2).
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePendingPolicy {
    /// Refuse the close immediately with `<error code="550">`; the
    /// channel stays `Active` and the peer may retry later.
    #[serde(rename = "Reject", alias = "reject")]
    Reject,
    /// Accept the close request but defer completing it: the channel
    /// moves to `Closing` (refusing new `MSG`s) and the `<ok>` is sent
    /// once every outstanding reply has been delivered.
    #[serde(rename = "Wait", alias = "wait")]
    Wait,
}
