// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed error taxonomy for the BEEP runtime.

use thiserror::Error;

/// Errors that can surface from frame decoding, channel management,
/// connection lifecycle, tuning resets and the listener.
#[derive(Debug, Error)]
pub enum BeepError {
    /// A peer sent bytes that violate the frame grammar, a sequence
    /// number that does not match the announced window, or any other
    /// wire-level contract. Always fatal to the connection.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A connection was rejected before the greeting exchange by a
    /// registered accept filter.
    #[error("connection filtered: {0}")]
    ConnectionFiltered(String),

    /// `start` was requested on a profile whose registration caps
    /// concurrent channels and the cap is currently exhausted.
    #[error("channel busy: {0}")]
    ChannelBusy(String),

    /// The remote peer answered a management request with an `<error>`
    /// element.
    #[error("remote refused (code {code}): {message}")]
    RemoteRefused {
        /// BEEP reply code from the `<error>` element.
        code: u16,
        /// Human readable diagnostic text supplied by the peer.
        message: String,
    },

    /// A reply, close handshake or tuning reset did not complete
    /// within its configured deadline.
    #[error("timed out waiting for {0}")]
    TimeoutError(String),

    /// The underlying transport failed (read/write/connect error).
    #[error("transport error: {0}")]
    TransportError(#[from] std::io::Error),

    /// A tuning reset (TLS or SASL profile handover) failed partway
    /// through and the connection must be torn down.
    #[error("tuning reset failed: {0}")]
    TuningFailure(String),

    /// DNS resolution of a listener or connect target failed.
    #[error("name resolution failed: {0}")]
    NameResolvFailure(String),

    /// `bind()` on a listener address failed.
    #[error("bind failed: {0}")]
    BindError(String),

    /// Socket creation failed before a connect/bind attempt.
    #[error("socket creation failed: {0}")]
    SocketCreationError(String),
}

pub type Result<T> = std::result::Result<T, BeepError>;
