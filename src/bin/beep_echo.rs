// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Minimal BEEP listener/client driver built on the echo profile,
//! used as a smoke test and a worked example of the public API.

use std::{sync::Arc, time::Duration};

use anyhow::{Context as _, Result};
use beep_rs::{
    cfg::{
        cli::{Cli, Command, resolve_config_path},
        config::Config,
        logger::init_logger,
    },
    context::Context,
    listener::Listener,
    profile::echo::{ECHO_PROFILE_URI, EchoProfile},
    session::Session,
};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _logger_guard = init_logger("config/logger.yaml")?;

    let cfg = resolve_config_path(&cli.config)
        .and_then(Config::load_from_file)
        .context("failed to resolve or load context config")?;

    let ctx = Context::new(cfg);
    ctx.register_profile(ECHO_PROFILE_URI, Arc::new(EchoProfile));

    match cli.command {
        Command::Listen { addr } => {
            let listener = Arc::new(Listener::new(ctx));
            info!(addr = %addr, "listening");
            listener.serve(&addr).await?;
        },
        Command::Send { addr, message } => {
            let session = Session::connect(ctx, &addr).await?;
            let channel = session.start_channel(ECHO_PROFILE_URI, None, None).await?;
            let reply = session.send_and_wait(&channel, None, message.as_bytes()).await?;
            match reply {
                beep_rs::channel::ExchangeReply::Rpy { payload, .. } => {
                    info!(reply = %String::from_utf8_lossy(&payload), "got reply");
                },
                beep_rs::channel::ExchangeReply::Err { code, message } => {
                    anyhow::bail!("peer refused with code {code}: {message}");
                },
            }
            session.close_channel(channel.number, 200).await?;
            session.close(Duration::from_secs(5)).await?;
        },
    }

    Ok(())
}
