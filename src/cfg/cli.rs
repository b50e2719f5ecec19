// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}

/// Command-line surface for the `beep-echo` demo binary.
#[derive(Parser, Debug)]
#[command(name = "beep-echo", about = "Minimal BEEP listener/client driver")]
pub struct Cli {
    /// Path to a YAML context configuration file.
    #[arg(long, default_value = "config/context.yaml")]
    pub config: String,

    /// Log level filter passed through to the tracing env-filter.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a listener that serves the echo profile on one address.
    Listen {
        /// `host:port` to bind.
        addr: String,
    },
    /// Connect to a listener, start a channel on the echo profile and
    /// send one message.
    Send {
        /// `host:port` to connect to.
        addr: String,
        /// Payload to send on the echo profile channel.
        message: String,
    },
}
