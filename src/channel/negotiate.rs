// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Locally-initiated channel `start`/`close` negotiation (§4.7): sends
//! the `<start>`/`<close>` element as a `MSG` on channel 0 and decodes
//! the peer's `<profile>`/`<ok>`/`<error>` reply. The channel-0
//! exchange itself reuses [`Channel::send_msg`], so no separate wire
//! plumbing is needed — only the XML encode/decode step is specific
//! to channel management.

use std::sync::Arc;

use crate::{
    channel::channel::{Channel, ExchangeReply},
    connection::conn::Connection,
    error::{BeepError, Result},
    greeting::xml::{ChannelZeroMsg, ProfileAd},
};

/// Outcome of a successful locally-initiated `<start>`.
pub struct StartedChannel {
    pub channel: Arc<Channel>,
    /// Piggy-backed content in the peer's `<profile>` reply, if any.
    pub piggyback: Option<Vec<u8>>,
}

/// Sends `<start number=… [serverName=…]><profile uri=…>…</profile></start>`
/// on channel 0 and waits for the peer's `<profile>` (success) or
/// `<error>` (refusal) reply. On success, registers and returns the
/// new [`Channel`].
pub async fn start_channel(
    conn: &Arc<Connection>,
    channel0: &Channel,
    profile_uri: &str,
    server_name: Option<&str>,
    piggyback: Option<&[u8]>,
    serialize: bool,
) -> Result<StartedChannel> {
    let number = conn.allocate_channel_number();
    let msg = ChannelZeroMsg::Start {
        number,
        server_name: server_name.map(|s| s.to_string()),
        profiles: vec![ProfileAd {
            uri: profile_uri.to_string(),
            encoding: piggyback.map(|_| "base64".to_string()),
            content: piggyback.map(|b| b.to_vec()),
        }],
    };
    let reply = channel0.send_msg(None, &msg.encode()).await?;
    let body = match reply {
        ExchangeReply::Rpy { payload, .. } => payload,
        ExchangeReply::Err { code, message } => {
            return Err(BeepError::RemoteRefused { code, message });
        },
    };

    match ChannelZeroMsg::parse(&body)? {
        ChannelZeroMsg::Profile(ad) => {
            let reply_piggyback = ad.content.clone();
            let window = conn.cfg.frame.default_window;
            let channel = Channel::new(
                number,
                profile_uri.to_string(),
                Arc::downgrade(conn),
                serialize,
                window,
                window,
            );
            channel.set_state(crate::channel::ChannelState::Active).await;
            conn.insert_channel(channel.clone());
            Ok(StartedChannel { channel, piggyback: reply_piggyback })
        },
        ChannelZeroMsg::Error { code, message } => Err(BeepError::RemoteRefused { code, message }),
        other => Err(BeepError::Protocol(format!(
            "unexpected channel-0 reply to <start>: {other:?}"
        ))),
    }
}

/// Sends `<close number=… code=…>` on channel 0 and waits for `<ok/>`.
/// A peer `<error>` reply surfaces as [`BeepError::RemoteRefused`]; per
/// §4.11, callers that race a local close against an inbound peer
/// close on the same channel should treat that inbound `<close>` as
/// the `<ok>` to their own request instead of calling this at all.
pub async fn close_channel(channel0: &Channel, number: u32, code: u16) -> Result<()> {
    let msg = ChannelZeroMsg::Close { number, code };
    let reply = channel0.send_msg(None, &msg.encode()).await?;
    let body = match reply {
        ExchangeReply::Rpy { payload, .. } => payload,
        ExchangeReply::Err { code, message } => {
            return Err(BeepError::RemoteRefused { code, message });
        },
    };
    match ChannelZeroMsg::parse(&body)? {
        ChannelZeroMsg::Ok => Ok(()),
        ChannelZeroMsg::Error { code, message } => Err(BeepError::RemoteRefused { code, message }),
        other => Err(BeepError::Protocol(format!(
            "unexpected channel-0 reply to <close>: {other:?}"
        ))),
    }
}
