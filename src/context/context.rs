// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The Context: process-wide shared state (§3, "Context"). Every
//! [`Connection`], [`Channel`](crate::channel::Channel) and reader task
//! belongs to exactly one Context; nothing outlives it.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::{net::TcpStream, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    cfg::{config::Config, enums::ConnRole},
    connection::conn::{ConnId, ConnStatus, Connection},
    concurrency::pool::WorkerPool,
    error::{BeepError, Result},
    greeting,
    profile::registry::{ProfileHandler, ProfileRegistry},
    reader,
    tuning::reset::{TuningBackend, client_tuning_reset},
};

/// Process-wide shared state a set of connections is built against
/// (§3 "Context"). Cloning a `Context` is cheap (it's an `Arc` handle
/// to the same registry, worker pool and connection table).
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    cfg: Config,
    profiles: Arc<ProfileRegistry>,
    pool: WorkerPool,
    connections: DashMap<ConnId, Arc<Connection>>,
    readers: DashMap<ConnId, JoinHandle<()>>,
    shutdown: CancellationToken,

    /// The backend `auto_tls` hands every freshly-connected initiator
    /// to, if one has been registered. `None` means `auto_tls` is a
    /// no-op regardless of config (no backend to run it with).
    tuning_backend: std::sync::Mutex<Option<Arc<dyn TuningBackend>>>,
}

impl Context {
    pub fn new(cfg: Config) -> Self {
        let pool = WorkerPool::new(cfg.runtime.worker_pool_size);
        Self {
            inner: Arc::new(ContextInner {
                cfg,
                profiles: Arc::new(ProfileRegistry::new()),
                pool,
                connections: DashMap::new(),
                readers: DashMap::new(),
                shutdown: CancellationToken::new(),
                tuning_backend: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Registers the backend `auto_tls` (§6) drives automatically after
    /// every outbound [`Context::connect`]. Typically a TLS
    /// [`TuningBackend`]; SASL backends are driven explicitly instead
    /// since they need per-connection credentials `connect` has no way
    /// to supply.
    pub fn register_tuning_backend(&self, backend: Arc<dyn TuningBackend>) {
        *self.inner.tuning_backend.lock().unwrap_or_else(|e| e.into_inner()) = Some(backend);
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    pub fn register_profile(&self, uri: impl Into<String>, handler: Arc<dyn ProfileHandler>) {
        self.inner.profiles.register(uri, handler);
    }

    pub fn profiles(&self) -> &Arc<ProfileRegistry> {
        &self.inner.profiles
    }

    /// Opens a new outbound (initiator) connection to `addr`, exchanges
    /// greetings, and starts watching it with the reader loop.
    pub async fn connect(&self, addr: &str) -> Result<Arc<Connection>> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(BeepError::TransportError)?;
        stream
            .set_nodelay(true)
            .map_err(BeepError::TransportError)?;

        let conn = Connection::new(Box::new(stream), ConnRole::Initiating, self.inner.cfg.clone());
        info!(addr, conn = conn.id.0, "connected, exchanging greetings");
        greeting::exchange_greetings(&conn, &self.inner.profiles, false).await?;
        self.watch(conn.clone());

        if self.inner.cfg.tuning.auto_tls {
            self.maybe_auto_tls(&conn).await?;
        }

        Ok(conn)
    }

    /// Drives an automatic tuning reset (§6 `auto_tls`) right after a
    /// connection joins the watch set. A peer refusal of the `<start>`
    /// (§8 property 6) leaves `conn` watched and usable as plain BEEP;
    /// any failure once the transport swap itself is underway is fatal
    /// to the connection, since the old transport is already gone.
    async fn maybe_auto_tls(&self, conn: &Arc<Connection>) -> Result<()> {
        let Some(backend) = self
            .inner
            .tuning_backend
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        else {
            return Ok(());
        };
        match client_tuning_reset(self, conn, backend.as_ref(), None, None).await {
            Ok(()) => Ok(()),
            Err(BeepError::RemoteRefused { code, message }) => {
                info!(conn = conn.id.0, code, message, "peer refused auto_tls, continuing in plain text");
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    /// Takes ownership of an already-accepted (and greeting-completed)
    /// connection and starts its reader task (§4.3 step 2's "only then
    /// is the connection visible to application channel operations").
    pub fn watch(&self, conn: Arc<Connection>) {
        let id = conn.id;
        let registry = self.inner.profiles.clone();
        let pool = self.inner.pool.clone();
        let handle = tokio::spawn(reader::run(conn.clone(), registry, pool));
        self.inner.connections.insert(id, conn);
        self.inner.readers.insert(id, handle);
    }

    /// Detaches `id` from the watch set without touching the socket —
    /// used by the tuning reset manager (§4.8) before swapping I/O, and
    /// by [`crate::session::Session::close`] once a connection is done
    /// for good. Returns once the reader task has actually stopped
    /// touching the connection. A tuning reset immediately calls
    /// [`Context::watch`] again with the same `Arc<Connection>`, which
    /// just overwrites this entry, so removing it here unconditionally
    /// is safe either way.
    pub async fn unwatch(&self, id: ConnId) {
        self.inner.connections.remove(&id);
        if let Some((_, handle)) = self.inner.readers.remove(&id) {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub fn get_connection(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.inner.connections.get(&id).map(|e| e.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Hard-stops every watched connection and drops them from the
    /// table. Per §3's invariant, no Connection may outlive its
    /// Context, so this is the only legitimate way to tear a Context
    /// down with connections still open.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let ids: Vec<ConnId> = self.inner.connections.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, conn)) = self.inner.connections.remove(&id) {
                conn.set_status(ConnStatus::Closed).await;
                conn.kill_now();
            }
            self.unwatch(id).await;
        }
        debug!("context shutdown complete");
    }
}
