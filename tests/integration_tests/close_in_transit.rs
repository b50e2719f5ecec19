// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{pin::Pin, sync::Arc};

use beep_rs::{
    channel::{Channel, ChannelState, negotiate},
    profile::{
        echo::ECHO_PROFILE_URI,
        registry::{ProfileHandler, StartAccepted, StartOutcome, StartRequest},
    },
    session::Session,
};

use crate::integration_tests::common;

type BoxFut<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Accepts a channel like [`beep_rs::profile::echo::EchoProfile`], but
/// also races its own `<close>` against whatever the peer sends,
/// synchronized via a barrier so both sides mark their channel
/// `Closing` and put a `<close>` on the wire at nearly the same time —
/// the condition §4.11's close-in-transit handling exists for.
struct RacingCloseProfile {
    barrier: Arc<tokio::sync::Barrier>,
}

impl ProfileHandler for RacingCloseProfile {
    fn on_start<'a>(&'a self, _req: &'a StartRequest) -> BoxFut<'a, StartOutcome> {
        Box::pin(async { Ok(StartAccepted::default()) })
    }

    fn on_started<'a>(&'a self, channel: Arc<Channel>) -> BoxFut<'a, ()> {
        let barrier = self.barrier.clone();
        Box::pin(async move {
            let Some(conn) = channel.connection() else {
                return;
            };
            tokio::spawn(async move {
                barrier.wait().await;
                channel.set_state(ChannelState::Closing).await;
                let Some(channel0) = conn.get_channel(0) else {
                    return;
                };
                match negotiate::close_channel(&channel0, channel.number, 200).await {
                    Ok(()) => {
                        conn.remove_channel(channel.number);
                    },
                    Err(e) => {
                        // A genuine protocol error here (anything other
                        // than having converged via the peer's own
                        // close) would be a real failure; surface it
                        // loudly rather than swallowing it.
                        panic!("responder-side close did not converge cleanly: {e}");
                    },
                }
            });
        })
    }
}

/// §8 property 7 / scenario S6: both peers issue `<close>` on the same
/// channel within a moment of each other. Both close attempts must
/// complete without error.
#[tokio::test]
async fn concurrent_close_from_both_peers_converges() {
    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let (_listener_ctx, addr) = common::spawn_listener(|ctx| {
        ctx.register_profile(ECHO_PROFILE_URI, Arc::new(RacingCloseProfile { barrier: barrier.clone() }));
    })
    .await;

    let session = Session::connect(common::client_context(), &addr.to_string())
        .await
        .expect("client connect failed");
    let channel = session
        .start_channel(ECHO_PROFILE_URI, None, None)
        .await
        .expect("start_channel failed");
    let number = channel.number;

    channel.set_state(ChannelState::Closing).await;
    let channel0 = session
        .connection()
        .get_channel(0)
        .expect("channel 0 missing");

    let result = tokio::time::timeout(common::STEP_TIMEOUT, async {
        barrier.wait().await;
        negotiate::close_channel(&channel0, number, 200).await
    })
    .await
    .expect("close race timed out");
    result.expect("client-side close did not converge cleanly");
    session.connection().remove_channel(number);

    session.close(common::STEP_TIMEOUT).await.expect("session close failed");
}
