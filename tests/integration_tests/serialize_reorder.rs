// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{pin::Pin, sync::Arc, time::Duration};

use beep_rs::{
    channel::{Channel, ExchangeReply},
    error::Result,
    profile::registry::{ProfileHandler, StartAccepted, StartOutcome, StartRequest},
    session::Session,
};

use crate::integration_tests::common;

const REORDER_PROFILE_URI: &str = "urn:test:reorder";

type BoxFut<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Replies to each inbound `MSG` on its own task, sleeping longer for
/// lower-numbered messages — so replies reach the wire in descending
/// msgno order even though requests were sent (and must be observed)
/// ascending.
struct ReorderingProfile;

impl ProfileHandler for ReorderingProfile {
    fn on_start<'a>(&'a self, _req: &'a StartRequest) -> BoxFut<'a, StartOutcome> {
        Box::pin(async { Ok(StartAccepted::default()) })
    }

    fn on_started<'a>(&'a self, channel: Arc<Channel>) -> BoxFut<'a, ()> {
        Box::pin(async move {
            let Some(mut inbound) = channel.take_inbound().await else {
                return;
            };
            tokio::spawn(async move {
                while let Some(msg) = inbound.recv().await {
                    let channel = channel.clone();
                    tokio::spawn(async move {
                        // Later msgnos reply sooner, so the peer would
                        // see them out of order without serialize=true.
                        let delay_ms = 60u64.saturating_sub(u64::from(msg.msgno) * 20);
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        let _ = channel.reply_rpy(msg.msgno, Some(&msg.mime), &msg.payload).await;
                    });
                }
            });
        })
    }
}

/// Awaits `fut`, then records `n` as having completed — used to observe
/// the order in which concurrently-issued requests actually resolve.
async fn track(order: &tokio::sync::Mutex<Vec<u32>>, n: u32, fut: impl std::future::Future<Output = Result<ExchangeReply>>) -> Result<ExchangeReply> {
    let r = fut.await;
    order.lock().await.push(n);
    r
}

/// §8 property 3 / scenario S3, end-to-end over a real socket pair:
/// with `serialize=true`, replies that arrive out of order on the wire
/// must still be observed by the application in ascending msgno order.
#[tokio::test]
async fn serialize_true_preserves_order_over_real_sockets() {
    let (_listener_ctx, addr) = common::spawn_listener(|ctx| {
        ctx.register_profile(REORDER_PROFILE_URI, Arc::new(ReorderingProfile));
    })
    .await;

    let mut client_cfg = beep_rs::cfg::config::Config::default();
    client_cfg.channel.serialize = true;
    let client_ctx = beep_rs::context::Context::new(client_cfg);

    let session = Session::connect(client_ctx, &addr.to_string())
        .await
        .expect("client connect failed");
    let channel = session
        .start_channel(REORDER_PROFILE_URI, None, None)
        .await
        .expect("start_channel failed");

    let order = tokio::sync::Mutex::new(Vec::new());
    let (r0, r1, r2) = tokio::join!(
        track(&order, 0, session.send_and_wait(&channel, None, b"msg-0")),
        track(&order, 1, session.send_and_wait(&channel, None, b"msg-1")),
        track(&order, 2, session.send_and_wait(&channel, None, b"msg-2")),
    );

    for (n, reply) in [(0u32, r0), (1, r1), (2, r2)] {
        match reply.unwrap_or_else(|e| panic!("send {n} failed: {e}")) {
            ExchangeReply::Rpy { payload, .. } => {
                assert_eq!(payload, bytes::Bytes::from(format!("msg-{n}")));
            },
            ExchangeReply::Err { code, message } => panic!("peer refused ({code}): {message}"),
        }
    }
    assert_eq!(&order.into_inner()[..], &[0, 1, 2]);

    session
        .close_channel(channel.number, 200)
        .await
        .expect("close_channel failed");
    session.close(common::STEP_TIMEOUT).await.expect("session close failed");
}
