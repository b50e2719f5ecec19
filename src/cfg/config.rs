// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::{ClosePendingPolicy, IoWaiterKind};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Frame-codec limits advertised to peers over this context.
    pub frame: FrameConfig,
    /// Listener accept-loop settings.
    pub listener: ListenerConfig,
    /// Outbound connect settings.
    pub connect: ConnectConfig,
    /// Tuning reset behaviour.
    pub tuning: TuningConfig,
    /// Per-channel defaults applied at `start` time.
    pub channel: ChannelDefaults,
    /// Implementation-only runtime knobs that never travel on the wire.
    pub runtime: RuntimeConfig,
}

/// Limits applied to every frame sent or accepted on a connection.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FrameConfig {
    #[serde(rename = "MaxFrameSize")]
    /// Hard ceiling on a single frame's payload size.
    pub max_frame_size: u32,

    #[serde(rename = "DefaultWindow")]
    /// Initial per-channel advertised receive window, in octets.
    pub default_window: u32,
}

/// Settings for the accept loop run by a listening context.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ListenerConfig {
    #[serde(rename = "Backlog")]
    /// `listen(2)` backlog passed to the bound socket.
    pub backlog: u32,

    #[serde(rename = "BindAddrs", default)]
    /// Addresses the listener binds to, `host:port` form.
    pub bind_addrs: Vec<String>,
}

/// Settings that govern outbound connection attempts.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConnectConfig {
    #[serde(rename = "ConnectTimeout", with = "serde_secs")]
    /// Upper bound on establishing the transport and exchanging greetings.
    pub connect_timeout: Duration,

    #[serde(rename = "ReplyTimeout", with = "serde_secs")]
    /// Upper bound on waiting for a reply to an outstanding MSG.
    pub reply_timeout: Duration,
}

/// Behaviour of the tuning reset manager (C11).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TuningConfig {
    #[serde(rename = "AutoTls")]
    /// Start a TLS tuning reset automatically once the peer advertises
    /// the TLS profile during greetings, rather than waiting for an
    /// explicit application request.
    pub auto_tls: bool,
}

/// Defaults applied when a new channel is started, unless the caller
/// overrides them explicitly.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ChannelDefaults {
    #[serde(rename = "Serialize")]
    /// Whether frames for a channel must be delivered to the
    /// application strictly in order (serialize = true) or may be
    /// dispatched out of order as they complete reassembly.
    pub serialize: bool,

    #[serde(rename = "PoolMaxIdlePerProfile")]
    /// Per-profile cap on idle channels retained by the channel pool
    /// (C12) for reuse. Zero disables pooling for that profile.
    pub pool_max_idle_per_profile: usize,

    #[serde(rename = "PoolAutoGrow")]
    /// Whether [`crate::channel::pool::ChannelPool::acquire`] misses are
    /// allowed to start a brand-new channel at all (true), or whether
    /// callers must treat a pool miss as "no channel available right
    /// now" (false) — relevant once a `serverName` has been pinned by a
    /// tuning reset, where unbounded growth could start channels under
    /// an identity the pool was never validated against.
    pub pool_auto_grow: bool,

    #[serde(rename = "ClosePendingPolicy")]
    /// What a responder does when a `<close>` arrives for a channel
    /// that still has outstanding (unreplied-to) local messages — §4.2.
    pub close_pending_policy: ClosePendingPolicy,
}

/// Implementation-only settings that do not correspond to any wire
/// value.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    #[serde(rename = "WorkerPoolSize")]
    /// Size of the bounded worker pool used to dispatch application
    /// callbacks and tuning reset drivers (C2).
    pub worker_pool_size: usize,

    #[serde(rename = "IoWaiter")]
    /// Which I/O readiness backend the reader loop is built on.
    pub io_waiter: IoWaiterKind,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.frame.max_frame_size >= 4096, "MaxFrameSize must be >= 4096");
        ensure!(self.frame.default_window >= 4096, "DefaultWindow must be >= 4096");
        ensure!(
            self.runtime.worker_pool_size >= 1,
            "WorkerPoolSize must be >= 1"
        );
        if self.listener.backlog == 0 {
            self.listener.backlog = 128;
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frame: FrameConfig {
                max_frame_size: 64 * 1024,
                default_window: 64 * 1024,
            },
            listener: ListenerConfig {
                backlog: 128,
                bind_addrs: Vec::new(),
            },
            connect: ConnectConfig {
                connect_timeout: Duration::from_secs(10),
                reply_timeout: Duration::from_secs(30),
            },
            tuning: TuningConfig { auto_tls: false },
            channel: ChannelDefaults {
                serialize: true,
                pool_max_idle_per_profile: 4,
                pool_auto_grow: true,
                close_pending_policy: ClosePendingPolicy::Reject,
            },
            runtime: RuntimeConfig {
                worker_pool_size: 16,
                io_waiter: IoWaiterKind::Tokio,
            },
        }
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
