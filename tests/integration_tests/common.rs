// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use beep_rs::{cfg::config::Config, context::Context, listener::Listener};

/// Starts a listener on an ephemeral loopback port with `profiles`
/// already registered, and returns its Context and bound address.
pub async fn spawn_listener(
    register: impl FnOnce(&Context),
) -> (Context, std::net::SocketAddr) {
    let ctx = Context::new(Config::default());
    register(&ctx);
    let listener = Arc::new(Listener::new(ctx.clone()));
    let addr = listener
        .bind_and_spawn("127.0.0.1:0")
        .await
        .expect("listener bind failed");
    (ctx, addr)
}

pub fn client_context() -> Context {
    Context::new(Config::default())
}

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);
