// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use beep_rs::{
    channel::ExchangeReply,
    profile::echo::{ECHO_PROFILE_URI, EchoProfile},
    session::Session,
};

use crate::integration_tests::common;

/// S1: connect, greet, start a channel, exchange one MSG/RPY, close
/// the channel, close the connection. Both sides reach Closed.
#[tokio::test]
async fn s1_basic_roundtrip_then_close() {
    let (_listener_ctx, addr) = common::spawn_listener(|ctx| {
        ctx.register_profile(ECHO_PROFILE_URI, Arc::new(EchoProfile));
    })
    .await;

    let session = Session::connect(common::client_context(), &addr.to_string())
        .await
        .expect("client connect failed");

    let channel = session
        .start_channel(ECHO_PROFILE_URI, None, None)
        .await
        .expect("start_channel failed");

    let reply = session
        .send_and_wait(&channel, None, b"hello")
        .await
        .expect("send_and_wait failed");
    match reply {
        ExchangeReply::Rpy { payload, .. } => assert_eq!(&payload[..], b"hello"),
        ExchangeReply::Err { code, message } => panic!("peer refused ({code}): {message}"),
    }

    session
        .close_channel(channel.number, 200)
        .await
        .expect("close_channel failed");
    session.close(common::STEP_TIMEOUT).await.expect("session close failed");
}
