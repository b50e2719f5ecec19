// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The tuning reset manager (C11, §4.8): restarts a connection's
//! transport in place for TLS or SASL profiles. Driven from either
//! side of a completed `<start>` — the initiator calls
//! [`client_tuning_reset`] right after [`negotiate::start_channel`]
//! succeeds; the responder registers a [`TuningProfileHandler`] whose
//! `on_started` hook calls [`run_tuning_reset`] itself.

use std::{future::Future, pin::Pin, sync::Arc};

use tracing::{info, warn};

use crate::{
    cfg::enums::ConnRole,
    channel::{Channel, ChannelState, negotiate},
    connection::conn::Connection,
    context::Context,
    error::{BeepError, Result},
    greeting,
    io::BoxedConnIo,
    profile::registry::{ProfileHandler, StartAccepted, StartOutcome, StartRequest},
};

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A transport-replacing handshake (TLS's `STARTTLS`-style upgrade, or
/// a SASL mechanism that negotiates a security layer). Consumes the
/// raw, unsplit connection I/O and hands back a new one wrapping it —
/// for TLS this is a `tokio_rustls`/`tokio_native_tls` stream; a SASL
/// mechanism with no confidentiality layer can just hand the same
/// `io` back unchanged.
pub trait TuningBackend: Send + Sync {
    /// The profile URI this backend answers `<start>` for, e.g.
    /// `"http://iana.org/beep/TLS"`.
    fn profile_uri(&self) -> &str;

    fn handshake<'a>(&'a self, io: BoxedConnIo, role: ConnRole) -> BoxFut<'a, Result<BoxedConnIo>>;
}

/// Runs a complete tuning reset (§4.8 steps 2-6) for `conn`, given that
/// `tuning_channel` has already been negotiated (a `<start>` for
/// `backend.profile_uri()` accepted by both peers) and is otherwise
/// unused. `speak_first` controls who greets first during the
/// re-exchange in step 5 and should match how `conn` originally
/// greeted (the listening role always speaks first).
pub async fn run_tuning_reset(
    ctx: &Context,
    conn: &Arc<Connection>,
    tuning_channel: u32,
    backend: &dyn TuningBackend,
    speak_first: bool,
) -> Result<()> {
    info!(conn = conn.id.0, channel = tuning_channel, "starting tuning reset");

    // Step 2 (the pre-read pin) and the remainder of the correctness
    // argument in §4.8 both reduce to one requirement: the existing
    // reader must stop touching the socket before teardown begins.
    ctx.unwatch(conn.id).await;

    if let Err(e) = teardown_for_reset(conn, tuning_channel).await {
        warn!(conn = conn.id.0, error = %e, "tuning teardown failed, aborting reset");
        conn.kill_now();
        return Err(e);
    }

    // Detaching the reader above already stops any further SEQ frames
    // from being emitted or processed on the old transport; channels
    // keep their window state across the swap below (§4.8) so no
    // separate flow-control teardown step is needed here.

    let raw = conn.take_io().await?;
    let new_io = match backend.handshake(raw, conn.role).await {
        Ok(io) => io,
        Err(e) => {
            warn!(conn = conn.id.0, error = %e, "tuning handshake failed");
            conn.kill_now();
            return Err(BeepError::TuningFailure(e.to_string()));
        },
    };
    conn.replace_io(new_io).await;

    let registry = ctx.profiles().clone();
    greeting::exchange_greetings(conn, &registry, speak_first).await?;

    ctx.watch(conn.clone());
    conn.mark_tls_activated();
    info!(conn = conn.id.0, "tuning reset complete");
    Ok(())
}

/// Convenience for the initiating side: negotiates `<start>` for
/// `backend.profile_uri()` on channel 0 and then runs the reset.
pub async fn client_tuning_reset(
    ctx: &Context,
    conn: &Arc<Connection>,
    backend: &dyn TuningBackend,
    server_name: Option<&str>,
    piggyback: Option<&[u8]>,
) -> Result<()> {
    let channel0 = conn
        .get_channel(0)
        .ok_or_else(|| BeepError::Protocol("no channel 0 to negotiate tuning on".into()))?;
    let started = negotiate::start_channel(
        conn,
        &channel0,
        backend.profile_uri(),
        server_name,
        piggyback,
        false,
    )
    .await?;
    // The initiator waited for the listener's greeting the first time
    // around (see `Context::connect`'s `speak_first = false`); the
    // re-greet after a tuning reset preserves the same asymmetry.
    run_tuning_reset(ctx, conn, started.channel.number, backend, false).await
}

/// Tears down every channel but 0 with a normal wire `<close>`
/// exchange, then discards channel 0 itself locally (§4.8 step 3)
/// without sending its `<close>` on the wire — that element's normal
/// handling ends the whole session (see
/// `greeting::handshake::handle_close`'s `number == 0` branch), which
/// is exactly what a tuning reset must not do.
async fn teardown_for_reset(conn: &Arc<Connection>, tuning_channel: u32) -> Result<()> {
    let Some(channel0) = conn.get_channel(0) else {
        return Err(BeepError::Protocol("no channel 0 during tuning teardown".into()));
    };

    let mut others: Vec<u32> = conn.channels.iter().map(|e| *e.key()).filter(|&n| n != 0).collect();
    others.sort_unstable();
    // The tuning channel itself is included in `others` and closed
    // like any other — its job ends the moment both peers agreed to
    // proceed with the reset.
    let _ = tuning_channel;

    for number in others {
        if let Some(channel) = conn.get_channel(number) {
            channel.set_state(ChannelState::Closing).await;
        }
        match negotiate::close_channel(&channel0, number, 200).await {
            Ok(()) => {
                conn.remove_channel(number);
            },
            Err(e) => {
                warn!(channel = number, error = %e, "failed to close channel during tuning teardown");
                return Err(e);
            },
        }
    }

    channel0.set_state(ChannelState::Closed).await;
    conn.remove_channel(0);
    Ok(())
}

/// A [`ProfileHandler`] that accepts `<start>` for a tuning profile
/// unconditionally and drives the reset itself once the channel is
/// live — what a listener registers to offer, say, TLS.
pub struct TuningProfileHandler {
    ctx: Context,
    backend: Arc<dyn TuningBackend + 'static>,
}

impl TuningProfileHandler {
    pub fn new(ctx: Context, backend: Arc<dyn TuningBackend + 'static>) -> Self {
        Self { ctx, backend }
    }
}

impl ProfileHandler for TuningProfileHandler {
    fn on_start<'a>(&'a self, _req: &'a StartRequest) -> BoxFut<'a, StartOutcome> {
        Box::pin(async { Ok(StartAccepted::default()) })
    }

    fn on_started<'a>(&'a self, channel: Arc<Channel>) -> BoxFut<'a, ()> {
        Box::pin(async move {
            let Some(conn) = channel.connection() else {
                return;
            };
            let ctx = self.ctx.clone();
            let backend = self.backend.clone();
            let number = channel.number;
            tokio::spawn(async move {
                // The listener always speaks first, both for the
                // session's original greeting and for the one this
                // reset re-runs.
                if let Err(e) = run_tuning_reset(&ctx, &conn, number, backend.as_ref(), true).await {
                    warn!(error = %e, "responder-side tuning reset failed");
                }
            });
        })
    }

    /// Once a tuning reset has completed on this connection, the same
    /// backend shouldn't be offered again (RFC 3080 §4's "a given
    /// tuning profile applies at most once per session").
    fn is_available(&self, conn: &Connection) -> bool {
        !conn.is_tls_activated()
    }
}
