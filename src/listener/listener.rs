// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The listener (C9): accepts connections and runs the two-phase
//! accept described in spec.md §4.3.
//!
//! Phase one (`initial_accept`) only performs the OS-level `accept()`
//! and wraps the socket in a [`Connection`] — no read happens yet.
//! Phase two (`second_step_accept`) runs the on-accept filter chain,
//! exchanges greetings, and only then registers the connection with
//! the [`Context`]'s watch set. Each accepted connection's phase two
//! runs on its own Tokio task bounded by `connect_timeout`, so a peer
//! that accepts and then stalls only ever blocks its own task — it
//! can't starve the reader loop of any other connection (the DoS
//! resistance property spec.md §8 calls out for the two-phase design).

use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener as TokioTcpListener;
use tracing::{info, warn};

use crate::{
    cfg::enums::ConnRole,
    connection::conn::Connection,
    context::Context,
    error::{BeepError, Result},
    greeting,
};

/// An ordered predicate consulted right after the TCP accept, before
/// any BEEP bytes are exchanged. The first filter to return `false`
/// causes the connection to be shut down with a `554` (the listener
/// never gets to send a greeting).
pub trait AcceptFilter: Send + Sync {
    fn accept(&self, peer: SocketAddr) -> bool;
}

/// Lets a registered handler inspect the first few bytes off the wire
/// (via `MSG_PEEK`-style peeking) before BEEP framing begins, so a
/// non-BEEP protocol (e.g. a bare TLS ClientHello) sharing the port
/// can claim the connection. Absent a match, or for data starting with
/// the literal bytes `RPY` (a plain BEEP greeting), the connection
/// proceeds as plain BEEP.
pub trait PortShareHandler: Send + Sync {
    /// `peeked` is up to 4 bytes read via `TcpStream::peek`. Returning
    /// `true` means this handler has claimed the connection and is
    /// responsible for driving it from here on (the listener stops
    /// processing it as BEEP).
    fn claims(&self, peeked: &[u8]) -> bool;
}

pub struct Listener {
    ctx: Context,
    filters: Vec<Arc<dyn AcceptFilter>>,
    port_share: Vec<Arc<dyn PortShareHandler>>,
    /// If set, the listener sends its `<greeting>` without waiting for
    /// the peer's first — accommodates older clients that wait to
    /// receive before sending (§4.6).
    send_greetings_on_connect: bool,
}

impl Listener {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            filters: Vec::new(),
            port_share: Vec::new(),
            send_greetings_on_connect: true,
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn AcceptFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_port_share(mut self, handler: Arc<dyn PortShareHandler>) -> Self {
        self.port_share.push(handler);
        self
    }

    /// Binds `addr` and accepts connections until `shutdown` fires,
    /// spawning a phase-two task per accepted socket. Each connection
    /// that completes its greeting successfully is handed to
    /// `self.ctx`'s watch set. Runs until shutdown; callers that need
    /// the bound address (e.g. tests binding `"127.0.0.1:0"`) should
    /// use [`Listener::bind_and_spawn`] instead.
    pub async fn serve(self: Arc<Self>, addr: &str) -> Result<()> {
        let tcp = TokioTcpListener::bind(addr)
            .await
            .map_err(|e| BeepError::BindError(e.to_string()))?;
        info!(addr, "listener bound");
        self.accept_loop(tcp).await
    }

    /// Binds `addr`, spawns the accept loop on its own task, and
    /// returns the bound [`SocketAddr`] immediately — the ephemeral
    /// port form (`"127.0.0.1:0"`) is otherwise unobservable until
    /// after the bind completes, which `serve` never returns control
    /// back for.
    pub async fn bind_and_spawn(self: Arc<Self>, addr: &str) -> Result<SocketAddr> {
        let tcp = TokioTcpListener::bind(addr)
            .await
            .map_err(|e| BeepError::BindError(e.to_string()))?;
        let local = tcp.local_addr().map_err(BeepError::TransportError)?;
        info!(addr = %local, "listener bound");
        tokio::spawn(async move {
            if let Err(e) = self.accept_loop(tcp).await {
                warn!(error = %e, "listener accept loop ended with error");
            }
        });
        Ok(local)
    }

    async fn accept_loop(self: Arc<Self>, tcp: TokioTcpListener) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.ctx.shutdown_token().cancelled() => {
                    info!("listener shutting down");
                    return Ok(());
                }
                accepted = tcp.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let this = self.clone();
                    tokio::spawn(async move { this.second_step_accept(stream, peer).await });
                }
            }
        }
    }

    async fn second_step_accept(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        for filter in &self.filters {
            if !filter.accept(peer) {
                warn!(%peer, "connection rejected by accept filter");
                return;
            }
        }

        if !self.port_share.is_empty() {
            let mut peek_buf = [0u8; 4];
            if let Ok(n) = stream.peek(&mut peek_buf).await
                && n > 0
            {
                let peeked = &peek_buf[..n];
                if peeked != b"RPY "
                    && let Some(handler) = self.port_share.iter().find(|h| h.claims(peeked))
                {
                    let _ = handler;
                    info!(%peer, "connection claimed by a port-share handler");
                    return;
                }
            }
        }

        let _ = stream.set_nodelay(true);
        let conn = Connection::new(Box::new(stream), ConnRole::Listening, self.ctx.config().clone());
        info!(%peer, conn = conn.id.0, "accepted, exchanging greetings");

        let timeout = self.ctx.config().connect.connect_timeout;
        let handshake = greeting::exchange_greetings(
            &conn,
            self.ctx.profiles(),
            self.send_greetings_on_connect,
        );
        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(_)) => {
                self.ctx.watch(conn);
            },
            Ok(Err(e)) => {
                warn!(%peer, error = %e, "greeting exchange failed");
                conn.kill_now();
            },
            Err(_) => {
                warn!(%peer, "greeting exchange timed out");
                conn.kill_now();
            },
        }
    }
}
