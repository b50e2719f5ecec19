// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The profiles registry (C8): maps a profile URI to the callbacks
//! that decide whether a `<start>` for it is accepted and that learn
//! about inbound messages/close, plus a mask predicate consulted when
//! advertising profiles and when deciding whether a URI is currently
//! startable (used to hide TLS/SASL after the session has consumed
//! them — §4.5).

use std::{future::Future, pin::Pin, sync::Arc};

use dashmap::DashMap;

use crate::connection::conn::Connection;

/// What a profile's `start` handler hands back when it accepts a
/// channel creation.
#[derive(Debug, Clone, Default)]
pub struct StartAccepted {
    /// Content piggy-backed in the `<profile>` element of our reply.
    pub piggyback: Option<Vec<u8>>,
}

/// What a profile's `start` handler hands back when it refuses.
#[derive(Debug, Clone)]
pub struct StartRefused {
    pub code: u16,
    pub message: String,
}

pub type StartOutcome = std::result::Result<StartAccepted, StartRefused>;

/// Everything a profile's start handler needs to decide and to act.
pub struct StartRequest {
    pub connection: Arc<Connection>,
    pub channel_number: u32,
    pub server_name: Option<String>,
    /// Piggy-backed content carried in the peer's `<profile>` element,
    /// already base64-decoded.
    pub piggyback: Option<Vec<u8>>,
}

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callbacks a profile registers under its URI (§3 "Profile
/// registration", §4.5).
pub trait ProfileHandler: Send + Sync {
    /// Decide whether to accept a `<start>` for this profile. Called
    /// before the channel is inserted into the connection's table; on
    /// refusal no [`crate::channel::Channel`] is ever created.
    fn on_start<'a>(&'a self, req: &'a StartRequest) -> BoxFut<'a, StartOutcome>;

    /// Invoked once the channel has actually been created and
    /// inserted, handed the live channel so the profile can stash its
    /// receiver end and start reacting to inbound `MSG`s.
    fn on_started<'a>(
        &'a self,
        channel: Arc<crate::channel::Channel>,
    ) -> BoxFut<'a, ()> {
        let _ = channel;
        Box::pin(async {})
    }

    /// Invoked when the channel this profile owns is closing, before
    /// the `<ok/>`/`<error>` reply is sent for the `<close>` request.
    fn on_close<'a>(&'a self, channel: Arc<crate::channel::Channel>) -> BoxFut<'a, ()> {
        let _ = channel;
        Box::pin(async {})
    }

    /// Whether this profile should currently be advertised/startable
    /// on `conn`. Used to hide SASL mechanisms after one has completed
    /// and to hide TLS once the transport is already secured.
    fn is_available(&self, conn: &Connection) -> bool {
        let _ = conn;
        true
    }
}

/// Per-context map from profile URI to its registered handler (§4.5).
#[derive(Default)]
pub struct ProfileRegistry {
    handlers: DashMap<String, Arc<dyn ProfileHandler>>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, uri: impl Into<String>, handler: Arc<dyn ProfileHandler>) {
        self.handlers.insert(uri.into(), handler);
    }

    pub fn get(&self, uri: &str) -> Option<Arc<dyn ProfileHandler>> {
        self.handlers.get(uri).map(|e| e.value().clone())
    }

    /// URIs currently unmasked for `conn`, in registration order is
    /// not guaranteed (DashMap iteration order is arbitrary) — callers
    /// that need a stable greeting should sort before emitting.
    pub fn advertisable(&self, conn: &Connection) -> Vec<String> {
        self.handlers
            .iter()
            .filter(|e| e.value().is_available(conn))
            .map(|e| e.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AcceptAll;
    impl ProfileHandler for AcceptAll {
        fn on_start<'a>(&'a self, _req: &'a StartRequest) -> BoxFut<'a, StartOutcome> {
            Box::pin(async { Ok(StartAccepted::default()) })
        }
    }

    #[test]
    fn register_and_lookup() {
        let reg = ProfileRegistry::new();
        reg.register("urn:test:echo", Arc::new(AcceptAll));
        assert!(reg.get("urn:test:echo").is_some());
        assert!(reg.get("urn:test:missing").is_none());
    }
}
