// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The channel pool (C12): a small cache of idle channels already
//! running a given profile, so a caller that repeatedly needs a
//! short-lived channel on a hot profile doesn't pay a `start`/`close`
//! round trip every time.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::channel::channel::Channel;

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<Arc<Channel>>,
    busy: Vec<Arc<Channel>>,
}

/// Per-profile pool of channels on one connection. Once a
/// `serverName` has been pinned by a tuning reset, the pool only ever
/// grows by reusing channels that were started under that same pinned
/// identity — see the design-note resolution in the project ledger
/// for why auto-growing a pool after pinning would be unsafe.
#[derive(Debug, Default)]
pub struct ChannelPool {
    state: Mutex<PoolState>,
    max_idle: usize,
}

impl ChannelPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            max_idle,
        }
    }

    /// Takes an idle channel if one is available.
    pub async fn acquire(&self) -> Option<Arc<Channel>> {
        let mut st = self.state.lock().await;
        let ch = st.idle.pop()?;
        st.busy.push(ch.clone());
        Some(ch)
    }

    /// Registers a freshly-started channel as busy (the caller is
    /// about to use it immediately).
    pub async fn adopt_busy(&self, channel: Arc<Channel>) {
        self.state.lock().await.busy.push(channel);
    }

    /// Returns a channel to the idle set once the caller is done with
    /// it. Channels beyond `max_idle` are dropped (and should be
    /// closed by the caller before calling this) rather than retained
    /// unboundedly.
    pub async fn release(&self, channel: Arc<Channel>) -> bool {
        let mut st = self.state.lock().await;
        st.busy.retain(|c| c.number != channel.number);
        if st.idle.len() >= self.max_idle {
            return false;
        }
        st.idle.push(channel);
        true
    }

    pub async fn idle_count(&self) -> usize {
        self.state.lock().await.idle.len()
    }

    pub async fn busy_count(&self) -> usize {
        self.state.lock().await.busy.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Weak};

    use super::*;

    fn dummy_channel(n: u32) -> Arc<Channel> {
        Channel::new(n, "echo".into(), Weak::new(), true, 64 * 1024, 64 * 1024)
    }

    #[tokio::test]
    async fn acquire_release_round_trip() {
        let pool = ChannelPool::new(2);
        assert!(pool.acquire().await.is_none());

        let ch = dummy_channel(3);
        assert!(pool.release(ch.clone()).await);
        assert_eq!(pool.idle_count().await, 1);

        let acquired = pool.acquire().await.unwrap();
        assert_eq!(acquired.number, 3);
        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    async fn release_beyond_capacity_is_rejected() {
        let pool = ChannelPool::new(1);
        assert!(pool.release(dummy_channel(1)).await);
        assert!(!pool.release(dummy_channel(3)).await);
        assert_eq!(pool.idle_count().await, 1);
    }
}
