// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Drives the channel-0 lifecycle (§4.7): the initial greeting
//! exchange, and — for as long as the connection is open — handling
//! inbound `<start>`/`<close>` requests against the context's profile
//! registry.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    channel::{
        channel::{Channel, ChannelState},
        negotiate,
    },
    connection::conn::{ConnStatus, Connection},
    error::{BeepError, Result},
    frame::{FrameHeader, MsgType},
    greeting::xml::{ChannelZeroMsg, ProfileAd},
    profile::registry::{ProfileRegistry, StartRequest},
};

/// Creates channel 0, sends the local `<greeting>` and waits for the
/// peer's. `initiate` is `true` when this side speaks first (the
/// listener always greets first per RFC 3081 §2.3, so initiators wait
/// to receive before they reply unless `send_greetings_on_connect` is
/// configured — see §4.6).
pub async fn exchange_greetings(
    conn: &Arc<Connection>,
    registry: &ProfileRegistry,
    speak_first: bool,
) -> Result<Arc<Channel>> {
    let channel0 = Channel::new(
        0,
        "channel-0".into(),
        Arc::downgrade(conn),
        false,
        u32::MAX,
        u32::MAX,
    );
    channel0.set_state(ChannelState::Active).await;
    conn.insert_channel(channel0.clone());

    if speak_first {
        send_local_greeting(conn, registry).await?;
        let peer = recv_greeting(conn).await?;
        record_peer_profiles(conn, peer).await;
    } else {
        let peer = recv_greeting(conn).await?;
        record_peer_profiles(conn, peer).await;
        send_local_greeting(conn, registry).await?;
    }

    conn.set_status(ConnStatus::Active).await;
    Ok(channel0)
}

async fn send_local_greeting(conn: &Arc<Connection>, registry: &ProfileRegistry) -> Result<()> {
    let mut uris = registry.advertisable(conn);
    uris.sort();
    let msg = ChannelZeroMsg::Greeting {
        profiles: uris
            .into_iter()
            .map(|uri| ProfileAd { uri, encoding: None, content: None })
            .collect(),
        features: None,
        localize: None,
    };
    write_channel_zero_frame(conn, MsgType::Rpy, 0, &msg.encode()).await
}

async fn recv_greeting(conn: &Arc<Connection>) -> Result<Vec<String>> {
    let (msg_type, _msgno, payload) = read_one_channel_zero_frame(conn).await?;
    if !matches!(msg_type, MsgType::Rpy | MsgType::Msg) {
        return Err(BeepError::Protocol(format!(
            "expected greeting RPY/MSG on channel 0, got {msg_type}"
        )));
    }
    match ChannelZeroMsg::parse(&payload)? {
        ChannelZeroMsg::Greeting { profiles, .. } => Ok(profiles.into_iter().map(|p| p.uri).collect()),
        other => Err(BeepError::Protocol(format!("expected <greeting>, got {other:?}"))),
    }
}

async fn record_peer_profiles(conn: &Arc<Connection>, profiles: Vec<String>) {
    *conn.peer_profiles.lock().await = profiles;
}

/// One iteration of the channel-0 request loop: reads the next
/// `<start>`/`<close>` MSG and dispatches it against `registry`.
/// Callers (the reader loop) invoke this in a loop for the lifetime of
/// the connection.
pub async fn handle_one_channel_zero_request(
    conn: &Arc<Connection>,
    registry: &Arc<ProfileRegistry>,
    msgno: u32,
    payload: &[u8],
) -> Result<()> {
    match ChannelZeroMsg::parse(payload)? {
        ChannelZeroMsg::Start { number, server_name, profiles } => {
            handle_start(conn, registry, msgno, number, server_name, profiles).await
        },
        ChannelZeroMsg::Close { number, code } => handle_close(conn, registry, msgno, number, code).await,
        other => Err(BeepError::Protocol(format!(
            "unexpected element on channel 0: {other:?}"
        ))),
    }
}

async fn handle_start(
    conn: &Arc<Connection>,
    registry: &Arc<ProfileRegistry>,
    msgno: u32,
    number: u32,
    server_name: Option<String>,
    profiles: Vec<ProfileAd>,
) -> Result<()> {
    if number == 0 || number % 2 == local_parity(conn) {
        return reply_channel_zero_error(
            conn,
            msgno,
            501,
            "channel number violates initiator/listener parity",
        )
        .await;
    }
    if conn.get_channel(number).is_some() {
        return reply_channel_zero_error(conn, msgno, 550, "channel already in use").await;
    }

    let Some(ad) = profiles.first() else {
        return reply_channel_zero_error(conn, msgno, 500, "no profile offered").await;
    };
    let Some(handler) = registry.get(&ad.uri) else {
        return reply_channel_zero_error(conn, msgno, 504, "profile not supported").await;
    };
    if !handler.is_available(conn) {
        return reply_channel_zero_error(conn, msgno, 504, "profile not currently available").await;
    }

    if let Some(name) = &server_name {
        let _ = conn.server_name.set(name.clone());
    }

    let req = StartRequest {
        connection: conn.clone(),
        channel_number: number,
        server_name: conn.server_name.get().cloned(),
        piggyback: ad.content.clone(),
    };

    match handler.on_start(&req).await {
        Ok(accepted) => {
            conn.observe_peer_channel_number(number);
            let window = conn.cfg.frame.default_window;
            let channel = Channel::new(
                number,
                ad.uri.clone(),
                Arc::downgrade(conn),
                conn.cfg.channel.serialize,
                window,
                window,
            );
            channel.set_state(ChannelState::Active).await;
            conn.insert_channel(channel.clone());

            let reply = ChannelZeroMsg::Profile(ProfileAd {
                uri: ad.uri.clone(),
                encoding: accepted.piggyback.as_ref().map(|_| "base64".to_string()),
                content: accepted.piggyback,
            });
            write_channel_zero_frame(conn, MsgType::Rpy, msgno, &reply.encode()).await?;
            handler.on_started(channel).await;
            Ok(())
        },
        Err(refused) => reply_channel_zero_error(conn, msgno, refused.code, &refused.message).await,
    }
}

async fn handle_close(
    conn: &Arc<Connection>,
    registry: &Arc<ProfileRegistry>,
    msgno: u32,
    number: u32,
    _code: u16,
) -> Result<()> {
    if number == 0 {
        if let Some(channel0) = conn.get_channel(0) {
            channel0.set_state(ChannelState::Closed).await;
        }
        write_channel_zero_frame(conn, MsgType::Rpy, msgno, &ChannelZeroMsg::Ok.encode()).await?;
        conn.set_status(ConnStatus::Closed).await;
        conn.kill_now();
        return Ok(());
    }

    let Some(channel) = conn.get_channel(number) else {
        return reply_channel_zero_error(conn, msgno, 550, "no such channel").await;
    };

    if channel.state().await == ChannelState::Closing {
        // Close in transit (§4.11): our own close is already
        // outstanding on this channel. Treat the peer's request as the
        // `<ok>` to it and converge without error on either side.
        debug!(channel = number, "close in transit, converging");
        channel.set_state(ChannelState::Closed).await;
        conn.remove_channel(number);
        return write_channel_zero_frame(conn, MsgType::Rpy, msgno, &ChannelZeroMsg::Ok.encode()).await;
    }

    if channel.outstanding_count() > 0 {
        match conn.cfg.channel.close_pending_policy {
            crate::cfg::enums::ClosePendingPolicy::Reject => {
                return reply_channel_zero_error(conn, msgno, 550, "channel has outstanding replies")
                    .await;
            },
            crate::cfg::enums::ClosePendingPolicy::Wait => {
                debug!(channel = number, "close accepted, deferring until replies drain");
                channel.set_state(ChannelState::Closing).await;
                let conn = conn.clone();
                let registry = registry.clone();
                tokio::spawn(async move {
                    if let Err(e) = channel.wait_until_drained(conn.cfg.connect.reply_timeout).await {
                        warn!(conn = conn.id.0, channel = number, error = %e, "close-pending drain failed, dropping channel");
                        conn.remove_channel(number);
                        return;
                    }
                    if let Some(handler) = registry.get(&channel.profile) {
                        handler.on_close(channel.clone()).await;
                    }
                    channel.set_state(ChannelState::Closed).await;
                    conn.remove_channel(number);
                    if let Err(e) =
                        write_channel_zero_frame(&conn, MsgType::Rpy, msgno, &ChannelZeroMsg::Ok.encode())
                            .await
                    {
                        warn!(conn = conn.id.0, channel = number, error = %e, "failed to complete deferred close");
                    }
                });
                return Ok(());
            },
        }
    }

    if let Some(handler) = registry.get(&channel.profile) {
        handler.on_close(channel.clone()).await;
    }
    channel.set_state(ChannelState::Closed).await;
    conn.remove_channel(number);
    write_channel_zero_frame(conn, MsgType::Rpy, msgno, &ChannelZeroMsg::Ok.encode()).await
}

/// Local channel numbers must differ in parity from the peer's:
/// listeners use even numbers, initiators odd (RFC 3080 §2.3.1.1). An
/// incoming `<start>` must request a number of the *other* parity.
fn local_parity(conn: &Connection) -> u32 {
    match conn.role {
        crate::cfg::enums::ConnRole::Listening => 0,
        crate::cfg::enums::ConnRole::Initiating => 1,
    }
}

async fn reply_channel_zero_error(
    conn: &Arc<Connection>,
    msgno: u32,
    code: u16,
    message: &str,
) -> Result<()> {
    warn!(code, message, "refusing channel-0 request");
    let err = ChannelZeroMsg::Error { code, message: message.to_string() };
    write_channel_zero_frame(conn, MsgType::Err, msgno, &err.encode()).await
}

async fn write_channel_zero_frame(
    conn: &Arc<Connection>,
    msg_type: MsgType,
    msgno: u32,
    body: &[u8],
) -> Result<()> {
    let mime = b"Content-Type: application/beep+xml\r\n\r\n";
    let mut payload = Vec::with_capacity(mime.len() + body.len());
    payload.extend_from_slice(mime);
    payload.extend_from_slice(body);

    let header = FrameHeader {
        msg_type,
        channel: 0,
        msgno,
        more: false,
        seqno: 0,
        size: payload.len() as u32,
        ansno: None,
    };
    let wire = conn.codec.encode(&header, &payload)?;
    conn.write_frame(&wire).await
}

/// Reads and reassembles frames off the wire until one complete
/// logical message addressed to channel 0 has arrived, without
/// involving the full reader loop — used only during the greeting
/// exchange, before the reader has been started for this connection.
async fn read_one_channel_zero_frame(conn: &Arc<Connection>) -> Result<(MsgType, u32, Vec<u8>)> {
    use bytes::BytesMut;

    use crate::frame::codec::DecodeOutcome;

    let mut scratch = BytesMut::new();
    let mut buf = vec![0u8; 4096];
    let mut assembled: Option<(MsgType, u32, Vec<u8>)> = None;

    loop {
        match conn.codec.decode(&mut scratch)? {
            DecodeOutcome::Frame(frame) => {
                if frame.header.channel != 0 {
                    return Err(BeepError::Protocol(
                        "expected a channel-0 frame before the reader loop starts".into(),
                    ));
                }
                let (msg_type, msgno, more) =
                    (frame.header.msg_type, frame.header.msgno, frame.header.more);
                let (_, cur_msgno, payload) = assembled.get_or_insert((msg_type, msgno, Vec::new()));
                if *cur_msgno != msgno {
                    return Err(BeepError::Protocol(
                        "fragmented channel-0 message changed msgno mid-stream".into(),
                    ));
                }
                payload.extend_from_slice(&frame.payload);
                if !more {
                    return Ok(assembled.take().unwrap());
                }
                continue;
            },
            DecodeOutcome::Seq(_) => {
                return Err(BeepError::Protocol(
                    "unexpected SEQ frame before the greeting exchange completed".into(),
                ));
            },
            DecodeOutcome::NeedMore => {},
        }
        let n = conn.read_some(&mut buf).await?;
        if n == 0 {
            return Err(BeepError::TransportError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before greeting completed",
            )));
        }
        scratch.extend_from_slice(&buf[..n]);
    }
}
