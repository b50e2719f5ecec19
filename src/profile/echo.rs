// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A tiny built-in profile that replies to every `MSG` with an `RPY`
//! carrying the same payload back. Used by the `beep-echo` demo binary
//! and by the crate's own integration tests (S1/S2/S3 in spec.md §8)
//! so they don't depend on an external profile implementation.

use std::sync::Arc;

use tracing::debug;

use crate::{
    channel::Channel,
    profile::registry::{ProfileHandler, StartAccepted, StartOutcome, StartRequest},
};

pub const ECHO_PROFILE_URI: &str = "http://example.com/beep/ECHO";

#[derive(Debug, Default)]
pub struct EchoProfile;

impl ProfileHandler for EchoProfile {
    fn on_start<'a>(
        &'a self,
        _req: &'a StartRequest,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = StartOutcome> + Send + 'a>> {
        Box::pin(async { Ok(StartAccepted::default()) })
    }

    fn on_started<'a>(
        &'a self,
        channel: Arc<Channel>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Some(mut inbound) = channel.take_inbound().await else {
                return;
            };
            tokio::spawn(async move {
                while let Some(msg) = inbound.recv().await {
                    debug!(msgno = msg.msgno, len = msg.payload.len(), "echoing message");
                    if channel
                        .reply_rpy(msg.msgno, Some(&msg.mime), &msg.payload)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        })
    }
}
