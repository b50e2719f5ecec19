// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    any::{Any, TypeId},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::{config::Config, enums::ConnRole},
    channel::{channel::Channel, pool::ChannelPool},
    error::{BeepError, Result},
    frame::FrameCodec,
    io::{BoxedConnIo, io_with_timeout},
};

/// Process-unique connection identifier, handed out by a
/// [`crate::context::Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

impl ConnId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle state of a connection, mirroring the graceful-vs-hard
/// shutdown distinction from the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Greetings have not completed yet.
    Handshaking,
    /// Normal operation; channels may be started and messages sent.
    Active,
    /// `quiesce_writes` has been called: no new writes are accepted,
    /// but in-flight replies are still being drained.
    Quiescing,
    /// Torn down; no further I/O will occur.
    Closed,
}

/// A single BEEP connection: one transport, the channel-0 management
/// channel, and whatever additional channels have been started on it.
pub struct Connection {
    pub id: ConnId,
    pub role: ConnRole,
    pub cfg: Config,
    pub codec: FrameCodec,

    /// `None` only for the brief window between [`Connection::take_io`]
    /// and the matching [`Connection::replace_io`] during a tuning
    /// reset (§4.8) — the reader task is guaranteed detached for the
    /// whole window, so no other caller observes it.
    reader: Mutex<Option<ReadHalf<BoxedConnIo>>>,
    writer: Mutex<Option<WriteHalf<BoxedConnIo>>>,

    pub(crate) channels: DashMap<u32, Arc<Channel>>,
    next_channel_number: AtomicU32,

    status: Mutex<ConnStatus>,

    /// Cancels both read and write paths immediately (hard stop).
    pub(crate) cancel: CancellationToken,
    /// Cancels only the write path (graceful quiesce).
    pub(crate) stop_writes: CancellationToken,

    /// Profiles the peer advertised in its greeting.
    pub peer_profiles: Mutex<Vec<String>>,
    /// `serverName` pinned by a completed tuning reset, if any. Once
    /// set it is never cleared: a connection identity only ever
    /// strengthens.
    pub server_name: OnceCell<String>,

    /// Set once a tuning reset (§4.8) has completed successfully on
    /// this connection — the "TLS-activated" flag scenario S4 checks
    /// after a refused `auto_tls` attempt.
    tls_activated: std::sync::atomic::AtomicBool,

    /// Per-profile idle channel pools (C12), created lazily.
    pub(crate) pools: DashMap<String, Arc<ChannelPool>>,

    /// Untyped extension slots for data that doesn't warrant a typed
    /// field (on-close handler lists, profile-specific session state).
    keyed_data: DashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(io: BoxedConnIo, role: ConnRole, cfg: Config) -> Arc<Self> {
        let (r, w) = tokio::io::split(io);
        let codec = FrameCodec::new(cfg.frame.max_frame_size);
        Arc::new(Self {
            id: ConnId::next(),
            role,
            codec,
            reader: Mutex::new(Some(r)),
            writer: Mutex::new(Some(w)),
            channels: DashMap::new(),
            // Channel 0 (management) is implicit; locally-started
            // channels begin numbering at 1.
            next_channel_number: AtomicU32::new(1),
            status: Mutex::new(ConnStatus::Handshaking),
            cancel: CancellationToken::new(),
            stop_writes: CancellationToken::new(),
            peer_profiles: Mutex::new(Vec::new()),
            server_name: OnceCell::new(),
            tls_activated: std::sync::atomic::AtomicBool::new(false),
            pools: DashMap::new(),
            keyed_data: DashMap::new(),
            cfg,
        })
    }

    pub async fn set_status(&self, status: ConnStatus) {
        *self.status.lock().await = status;
    }

    pub async fn status(&self) -> ConnStatus {
        *self.status.lock().await
    }

    pub fn allocate_channel_number(&self) -> u32 {
        self.next_channel_number.fetch_add(2, Ordering::SeqCst)
    }

    /// Records that the peer used `number` for a channel it started,
    /// so a subsequent locally-started channel never collides with
    /// it. RFC 3080 only requires strictly-increasing-per-peer channel
    /// numbers, not a fixed parity; tracking the peer's high-water
    /// mark independently of ours keeps both directions conflict-free
    /// without requiring coordination.
    pub fn observe_peer_channel_number(&self, number: u32) {
        let mut cur = self.next_channel_number.load(Ordering::SeqCst);
        while number >= cur {
            match self.next_channel_number.compare_exchange_weak(
                cur,
                number + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn insert_channel(&self, channel: Arc<Channel>) {
        self.channels.insert(channel.number, channel);
    }

    pub fn get_channel(&self, number: u32) -> Option<Arc<Channel>> {
        self.channels.get(&number).map(|e| e.value().clone())
    }

    pub fn remove_channel(&self, number: u32) -> Option<Arc<Channel>> {
        self.channels.remove(&number).map(|(_, c)| c)
    }

    /// Returns (creating if necessary) the idle-channel pool for
    /// `profile_uri`.
    fn pool_for(&self, profile_uri: &str) -> Arc<ChannelPool> {
        self.pools
            .entry(profile_uri.to_string())
            .or_insert_with(|| Arc::new(ChannelPool::new(self.cfg.channel.pool_max_idle_per_profile)))
            .clone()
    }

    /// Takes an idle pooled channel for `profile_uri`, if one is
    /// available.
    pub async fn pool_acquire(&self, profile_uri: &str) -> Option<Arc<Channel>> {
        self.pool_for(profile_uri).acquire().await
    }

    /// Returns a channel to its profile's idle pool once the caller is
    /// done with it. Returns `false` (and the channel should then be
    /// closed normally instead) if the pool is already at capacity.
    pub async fn pool_release(&self, profile_uri: &str, channel: Arc<Channel>) -> bool {
        self.pool_for(profile_uri).release(channel).await
    }

    pub fn set_keyed<T: Send + Sync + 'static>(&self, value: T) {
        self.keyed_data.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn with_keyed<T: Send + Sync + 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.keyed_data
            .get(&TypeId::of::<T>())
            .and_then(|b| b.downcast_ref::<T>().map(f))
    }

    /// Forbid new writes (no FIN). The reader continues to receive and
    /// deliver all in-flight frames.
    pub fn quiesce_writes(&self) {
        self.stop_writes.cancel();
    }

    /// Waits until every channel has no outstanding local message
    /// waiting on a reply, or `max_wait` elapses.
    pub async fn wait_inflight_drained(&self, max_wait: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let outstanding: usize = self
                .channels
                .iter()
                .map(|e| e.value().outstanding_count())
                .sum();
            if outstanding == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BeepError::TimeoutError(format!(
                    "drain timeout: {outstanding} outstanding replies"
                )));
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(BeepError::TimeoutError("cancelled".into())),
                _ = tokio::time::sleep(Duration::from_millis(50)) => {},
            }
        }
    }

    /// Forbid new writes and wait for in-flight replies to drain, but
    /// leave the TCP connection itself open (no FIN).
    pub async fn graceful_quiesce(&self, max_wait: Duration) -> Result<()> {
        self.quiesce_writes();
        self.wait_inflight_drained(max_wait).await
    }

    /// Half-closes the write side (sends FIN). Irreversible; the
    /// reader keeps consuming until EOF.
    pub async fn half_close_writes(&self) -> Result<()> {
        let mut w = self.writer.lock().await;
        if let Some(w) = w.as_mut() {
            let _ = w.shutdown().await;
        }
        Ok(())
    }

    /// Hard stop: cancels both read and write paths immediately.
    pub fn kill_now(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether a tuning reset (§4.8) has completed on this connection.
    pub fn is_tls_activated(&self) -> bool {
        self.tls_activated.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_tls_activated(&self) {
        self.tls_activated.store(true, Ordering::SeqCst);
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Writes a fully-encoded frame to the socket, subject to the
    /// connection's I/O timeout and cancellation tokens.
    pub async fn write_frame(&self, bytes: &[u8]) -> Result<()> {
        if self.cancel.is_cancelled() || self.stop_writes.is_cancelled() {
            return Err(BeepError::Protocol("connection is not accepting writes".into()));
        }
        let mut guard = self.writer.lock().await;
        let w = guard
            .as_mut()
            .ok_or_else(|| BeepError::Protocol("connection has no writer (mid tuning reset)".into()))?;
        io_with_timeout(
            "write frame",
            w.write_all(bytes),
            self.cfg.connect.reply_timeout,
            &self.cancel,
        )
        .await?;
        debug!(bytes = bytes.len(), "wrote frame");
        Ok(())
    }

    /// Reads up to `buf.len()` bytes, returning the number of bytes
    /// read (0 on a clean EOF), used by the reader loop (C6).
    pub async fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
        use tokio::io::AsyncReadExt;
        if self.cancel.is_cancelled() {
            return Err(BeepError::Protocol("connection cancelled".into()));
        }
        let mut guard = self.reader.lock().await;
        let r = guard
            .as_mut()
            .ok_or_else(|| BeepError::Protocol("connection has no reader (mid tuning reset)".into()))?;
        let n = io_with_timeout(
            "read frame bytes",
            r.read(buf),
            self.cfg.connect.reply_timeout,
            &self.cancel,
        )
        .await?;
        Ok(n)
    }

    /// Swaps the underlying transport for a new one, as part of a
    /// tuning reset (§4.8). Callers must have already stopped the
    /// reader task and waited for any in-flight write to finish;
    /// holding both locks here guarantees no other task is mid-I/O
    /// during the swap.
    pub async fn replace_io(&self, new_io: BoxedConnIo) {
        let mut r = self.reader.lock().await;
        let mut w = self.writer.lock().await;
        let (nr, nw) = tokio::io::split(new_io);
        *r = Some(nr);
        *w = Some(nw);
        warn!("connection transport replaced (tuning reset)");
    }

    /// Takes the raw transport out of the connection entirely, leaving
    /// both halves empty until [`Connection::replace_io`] puts a new
    /// one back. Used by the tuning reset manager (§4.8) to hand the
    /// socket to a TLS/SASL backend's handshake. Callers must have
    /// already detached the reader task; no other method on this
    /// connection will succeed until `replace_io` is called.
    pub async fn take_io(&self) -> Result<BoxedConnIo> {
        let mut r = self.reader.lock().await;
        let mut w = self.writer.lock().await;
        let rh = r
            .take()
            .ok_or_else(|| BeepError::Protocol("connection transport already taken".into()))?;
        let wh = w
            .take()
            .ok_or_else(|| BeepError::Protocol("connection transport already taken".into()))?;
        Ok(rh.unsplit(wh))
    }
}
