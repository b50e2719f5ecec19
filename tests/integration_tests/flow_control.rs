// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use beep_rs::{
    cfg::config::Config,
    channel::ExchangeReply,
    context::Context,
    listener::Listener,
    profile::echo::{ECHO_PROFILE_URI, EchoProfile},
    session::Session,
};

use crate::integration_tests::common;

/// A window and frame size small enough that a handful of sequential
/// messages force several SEQ-driven window updates, without any
/// single message exceeding the window outright.
fn narrow_window_config() -> Config {
    let mut cfg = Config::default();
    cfg.frame.max_frame_size = 4096;
    cfg.frame.default_window = 4096;
    cfg
}

/// §8 property 4 / scenario S2 (scaled down): sending more cumulative
/// payload than the initial window allows must still succeed, because
/// the peer emits `SEQ` updates as it receives data and the sender's
/// window is replenished before it would otherwise be exhausted.
#[tokio::test]
async fn repeated_sends_survive_seq_driven_window_updates() {
    let listener_ctx = Context::new(narrow_window_config());
    listener_ctx.register_profile(ECHO_PROFILE_URI, Arc::new(EchoProfile));
    let listener = Arc::new(Listener::new(listener_ctx.clone()));
    let addr = listener
        .bind_and_spawn("127.0.0.1:0")
        .await
        .expect("listener bind failed");

    let client_ctx = Context::new(narrow_window_config());
    let session = Session::connect(client_ctx, &addr.to_string())
        .await
        .expect("client connect failed");

    let channel = session
        .start_channel(ECHO_PROFILE_URI, None, None)
        .await
        .expect("start_channel failed");

    // Five 2000-byte messages: 10000 bytes total, well past the 4096
    // byte initial window, each message individually within it.
    let body = vec![0x5Au8; 2000];
    for i in 0..5u32 {
        let reply = session
            .send_and_wait(&channel, None, &body)
            .await
            .unwrap_or_else(|e| panic!("send {i} failed: {e}"));
        match reply {
            ExchangeReply::Rpy { payload, .. } => assert_eq!(&payload[..], &body[..]),
            ExchangeReply::Err { code, message } => panic!("peer refused ({code}): {message}"),
        }
    }

    session
        .close_channel(channel.number, 200)
        .await
        .expect("close_channel failed");
    session.close(common::STEP_TIMEOUT).await.expect("session close failed");
}
