// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashSet, sync::Arc};

use beep_rs::{profile::echo::{ECHO_PROFILE_URI, EchoProfile}, session::Session};

use crate::integration_tests::common;

/// §8 property 8: N concurrent channel creates, followed by N
/// concurrent closes, on one connection must leave the channel table
/// with no lost or duplicated entries — every started channel got a
/// distinct number, and every close actually found (and removed) the
/// channel it targeted.
#[tokio::test]
async fn concurrent_creates_and_closes_leave_no_lost_or_duplicated_entries() {
    const N: usize = 20;

    let (_listener_ctx, addr) = common::spawn_listener(|ctx| {
        ctx.register_profile(ECHO_PROFILE_URI, Arc::new(EchoProfile));
    })
    .await;

    let session = Session::connect(common::client_context(), &addr.to_string())
        .await
        .expect("client connect failed");

    let mut starts = Vec::new();
    for _ in 0..N {
        let session = session.clone();
        starts.push(tokio::spawn(
            async move { session.start_channel(ECHO_PROFILE_URI, None, None).await },
        ));
    }
    let mut numbers = HashSet::new();
    let mut channels = Vec::new();
    for start in starts {
        let channel = start
            .await
            .expect("start task panicked")
            .expect("start_channel failed");
        assert!(numbers.insert(channel.number), "duplicate channel number {}", channel.number);
        channels.push(channel);
    }
    assert_eq!(numbers.len(), N);

    let mut closes = Vec::new();
    for channel in &channels {
        let session = session.clone();
        let number = channel.number;
        closes.push(tokio::spawn(async move { session.close_channel(number, 200).await }));
    }
    for close in closes {
        close
            .await
            .expect("close task panicked")
            .expect("close_channel failed");
    }

    for channel in &channels {
        assert!(
            session.connection().get_channel(channel.number).is_none(),
            "channel {} still present after close",
            channel.number
        );
    }

    session.close(common::STEP_TIMEOUT).await.expect("session close failed");
}
