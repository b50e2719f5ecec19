// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client-facing session API (§7): a thin ergonomic wrapper over a
//! [`Context`] + [`Connection`] pair for the common case of "one
//! connection, a handful of channels, wait for each reply". Nothing
//! here is load-bearing — it's direct calls into
//! [`crate::channel::negotiate`] and [`Channel`] — so callers that
//! need finer control (pipelined `MSG`s, `ANS` streams, tuning resets)
//! drop down to those types directly instead.

use std::{sync::Arc, time::Duration};

use crate::{
    channel::{
        channel::{Channel, ExchangeReply},
        negotiate,
    },
    connection::conn::{ConnStatus, Connection},
    context::Context,
    error::{BeepError, Result},
    frame::MimeHeaders,
};

/// One BEEP session: a connection plus the Context it's registered
/// with. Cloning a `Session` is cheap and shares the same connection.
#[derive(Clone)]
pub struct Session {
    ctx: Context,
    conn: Arc<Connection>,
}

impl Session {
    /// Opens a new connection to `addr`, exchanges greetings, and
    /// starts its reader loop under `ctx`'s watch set.
    pub async fn connect(ctx: Context, addr: &str) -> Result<Self> {
        let conn = ctx.connect(addr).await?;
        Ok(Self { ctx, conn })
    }

    /// Wraps an already-connected, already-watched connection (e.g.
    /// one handed to a listener's accept filter) as a `Session`.
    pub fn from_connection(ctx: Context, conn: Arc<Connection>) -> Self {
        Self { ctx, conn }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    fn channel0(&self) -> Result<Arc<Channel>> {
        self.conn
            .get_channel(0)
            .ok_or_else(|| BeepError::Protocol("session has no channel 0".into()))
    }

    /// Starts a new channel for `profile_uri`, using the Context's
    /// configured default for `serialize` (§3.3, 3.4).
    pub async fn start_channel(
        &self,
        profile_uri: &str,
        server_name: Option<&str>,
        piggyback: Option<&[u8]>,
    ) -> Result<Arc<Channel>> {
        let channel0 = self.channel0()?;
        let serialize = self.ctx.config().channel.serialize;
        let started = negotiate::start_channel(
            &self.conn,
            &channel0,
            profile_uri,
            server_name,
            piggyback,
            serialize,
        )
        .await?;
        Ok(started.channel)
    }

    /// Like [`Session::start_channel`], but first tries the connection's
    /// idle channel pool (C12) for `profile_uri` before negotiating a
    /// fresh `<start>`. Pair with [`Session::release_pooled_channel`]
    /// instead of [`Session::close_channel`] so the channel can be
    /// reused by a later caller.
    pub async fn start_pooled_channel(
        &self,
        profile_uri: &str,
        server_name: Option<&str>,
        piggyback: Option<&[u8]>,
    ) -> Result<Arc<Channel>> {
        if let Some(channel) = self.conn.pool_acquire(profile_uri).await {
            return Ok(channel);
        }
        if !self.ctx.config().channel.pool_auto_grow {
            return Err(BeepError::Protocol(format!(
                "no pooled channel available for {profile_uri} and pool auto-grow is disabled"
            )));
        }
        self.start_channel(profile_uri, server_name, piggyback).await
    }

    /// Returns a channel acquired via [`Session::start_pooled_channel`]
    /// to its profile's idle pool instead of negotiating a real
    /// `<close>`. If the pool is already at capacity the channel is
    /// closed normally instead.
    pub async fn release_pooled_channel(&self, profile_uri: &str, channel: Arc<Channel>) -> Result<()> {
        let number = channel.number;
        if self.conn.pool_release(profile_uri, channel).await {
            return Ok(());
        }
        self.close_channel(number, 200).await
    }

    /// Sends a `MSG` on `channel` and waits for the matching `RPY`/`ERR`.
    pub async fn send_and_wait(
        &self,
        channel: &Channel,
        mime: Option<&MimeHeaders>,
        body: &[u8],
    ) -> Result<ExchangeReply> {
        channel.send_msg(mime, body).await
    }

    /// Closes a single channel with the given BEEP reply code
    /// (normally 200) and removes it from the connection's table.
    pub async fn close_channel(&self, number: u32, code: u16) -> Result<()> {
        let channel0 = self.channel0()?;
        // Mark Closing before the request goes out so a peer `<close>`
        // racing in on the same channel is recognized as close-in-transit
        // (§4.11) rather than an outstanding-replies conflict.
        if let Some(channel) = self.conn.get_channel(number) {
            channel.set_state(crate::channel::ChannelState::Closing).await;
        }
        negotiate::close_channel(&channel0, number, code).await?;
        self.conn.remove_channel(number);
        Ok(())
    }

    /// Ends the whole session: waits up to `max_wait` for in-flight
    /// replies to drain, then closes channel 0 (which both peers treat
    /// as ending the connection, see
    /// `greeting::handshake::handle_close`), and stops watching it.
    ///
    /// The `<close>` itself must go out before writes are forbidden —
    /// `graceful_quiesce` cancels `stop_writes`, and `write_frame`
    /// rejects every write, channel-0 management frames included, once
    /// that token is cancelled.
    pub async fn close(&self, max_wait: Duration) -> Result<()> {
        self.conn.wait_inflight_drained(max_wait).await?;
        let channel0 = self.channel0()?;
        negotiate::close_channel(&channel0, 0, 200).await?;
        self.conn.quiesce_writes();
        self.ctx.unwatch(self.conn.id).await;
        self.conn.set_status(ConnStatus::Closed).await;
        self.conn.kill_now();
        Ok(())
    }
}

/// A blocking façade over [`Session`] for callers outside an async
/// runtime, per §7's "synchronous form is a strict wrapper of the
/// asynchronous one plus a bounded wait" — every method here just
/// blocks a dedicated current-thread runtime on the matching `Session`
/// call.
pub struct BlockingSession {
    rt: tokio::runtime::Runtime,
    session: Session,
}

impl BlockingSession {
    pub fn connect(ctx: Context, addr: &str) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(BeepError::TransportError)?;
        let session = rt.block_on(Session::connect(ctx, addr))?;
        Ok(Self { rt, session })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn start_channel(
        &self,
        profile_uri: &str,
        server_name: Option<&str>,
        piggyback: Option<&[u8]>,
    ) -> Result<Arc<Channel>> {
        self.rt
            .block_on(self.session.start_channel(profile_uri, server_name, piggyback))
    }

    pub fn start_pooled_channel(
        &self,
        profile_uri: &str,
        server_name: Option<&str>,
        piggyback: Option<&[u8]>,
    ) -> Result<Arc<Channel>> {
        self.rt.block_on(
            self.session
                .start_pooled_channel(profile_uri, server_name, piggyback),
        )
    }

    pub fn release_pooled_channel(&self, profile_uri: &str, channel: Arc<Channel>) -> Result<()> {
        self.rt
            .block_on(self.session.release_pooled_channel(profile_uri, channel))
    }

    pub fn send_and_wait(
        &self,
        channel: &Channel,
        mime: Option<&MimeHeaders>,
        body: &[u8],
    ) -> Result<ExchangeReply> {
        self.rt.block_on(self.session.send_and_wait(channel, mime, body))
    }

    pub fn close_channel(&self, number: u32, code: u16) -> Result<()> {
        self.rt.block_on(self.session.close_channel(number, code))
    }

    pub fn close(&self, max_wait: Duration) -> Result<()> {
        self.rt.block_on(self.session.close(max_wait))
    }
}
