// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The reader loop (C6): one Tokio task per watched connection,
//! demultiplexing decoded frames to either the channel-0 management
//! handler (C10) or the addressed [`Channel`](crate::channel::Channel).
//!
//! Per spec.md §4.3 the reader never blocks on an application handler
//! — frame-received dispatch for non-zero channels happens inline
//! (delivery is just a bounded `mpsc` send, already non-blocking under
//! normal load) while anything that could run arbitrary application
//! code (the channel-0 `<start>`/`<close>` handlers, which invoke a
//! profile's callbacks) is handed to the [`WorkerPool`] so a slow
//! profile callback cannot stall frame delivery for other connections.

use std::{collections::HashMap, sync::Arc};

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::{
    concurrency::pool::WorkerPool,
    connection::conn::{ConnStatus, Connection},
    frame::{MsgType, codec::DecodeOutcome},
    greeting,
    profile::registry::ProfileRegistry,
};

const READ_CHUNK: usize = 16 * 1024;

struct PendingFrame {
    msg_type: MsgType,
    payload: BytesMut,
}

/// Per-connection reassembly state, keyed by `(channel, msgno, ansno)`
/// so that fragmented `ANS` streams with distinct `ansno` values don't
/// clobber one another (spec.md §3's "Pending-frame buffer" names the
/// key as `(connection, channel, msgno)`; including `ansno` is a
/// superset that degrades to the same behavior whenever a channel
/// never pipelines more than one in-flight `ANS` sequence at a time).
type PendingKey = (u32, u32, Option<u32>);

/// Runs the reader loop for `conn` until the connection is cancelled,
/// hits EOF, or a fatal protocol/transport error occurs. Returns once
/// the connection is no longer readable; the caller (the
/// [`crate::context::Context`] that spawned this task) is responsible
/// for removing `conn` from its watch set afterward.
pub async fn run(conn: Arc<Connection>, registry: Arc<ProfileRegistry>, pool: WorkerPool) {
    let mut scratch = BytesMut::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut pending: HashMap<PendingKey, PendingFrame> = HashMap::new();

    loop {
        if conn.is_cancelled() {
            debug!(conn = conn.id.0, "reader stopping: connection cancelled");
            return;
        }

        let n = match conn.read_some(&mut buf).await {
            Ok(0) => {
                debug!(conn = conn.id.0, "reader stopping: peer closed");
                conn.set_status(ConnStatus::Closed).await;
                return;
            },
            Ok(n) => n,
            Err(e) => {
                warn!(conn = conn.id.0, error = %e, "reader stopping: transport error");
                conn.set_status(ConnStatus::Closed).await;
                conn.kill_now();
                return;
            },
        };
        scratch.extend_from_slice(&buf[..n]);

        loop {
            match conn.codec.decode(&mut scratch) {
                Ok(DecodeOutcome::Frame(frame)) => {
                    if let Err(e) =
                        dispatch_frame(&conn, &registry, &pool, &mut pending, frame).await
                    {
                        warn!(conn = conn.id.0, error = %e, "fatal protocol error, closing connection");
                        conn.set_status(ConnStatus::Closed).await;
                        conn.kill_now();
                        return;
                    }
                },
                Ok(DecodeOutcome::Seq(seq)) => {
                    if let Some(channel) = conn.get_channel(seq.channel) {
                        if let Err(e) = channel.apply_seq(&seq) {
                            warn!(conn = conn.id.0, channel = seq.channel, error = %e, "invalid SEQ frame, closing connection");
                            conn.set_status(ConnStatus::Closed).await;
                            conn.kill_now();
                            return;
                        }
                    } else {
                        debug!(channel = seq.channel, "SEQ frame for unknown channel, dropping");
                    }
                },
                Ok(DecodeOutcome::NeedMore) => break,
                Err(e) => {
                    warn!(conn = conn.id.0, error = %e, "frame decode error, closing connection");
                    conn.set_status(ConnStatus::Closed).await;
                    conn.kill_now();
                    return;
                },
            }
        }
    }
}

async fn dispatch_frame(
    conn: &Arc<Connection>,
    registry: &Arc<ProfileRegistry>,
    pool: &WorkerPool,
    pending: &mut HashMap<PendingKey, PendingFrame>,
    frame: crate::frame::codec::Frame,
) -> crate::error::Result<()> {
    let header = frame.header;
    let key: PendingKey = (header.channel, header.msgno, header.ansno);

    if header.channel != 0 {
        if let Some(channel) = conn.get_channel(header.channel) {
            channel.note_wire_bytes_received(frame.payload.len() as u32).await?;
        }
    }

    let complete_payload: Bytes = if header.more {
        let entry = pending.entry(key).or_insert_with(|| PendingFrame {
            msg_type: header.msg_type,
            payload: BytesMut::new(),
        });
        if entry.msg_type != header.msg_type {
            return Err(crate::error::BeepError::Protocol(format!(
                "fragment type changed mid-message on channel {}",
                header.channel
            )));
        }
        entry.payload.extend_from_slice(&frame.payload);
        return Ok(());
    } else if let Some(mut accum) = pending.remove(&key) {
        if accum.msg_type != header.msg_type {
            return Err(crate::error::BeepError::Protocol(format!(
                "final fragment type mismatch on channel {}",
                header.channel
            )));
        }
        accum.payload.extend_from_slice(&frame.payload);
        accum.payload.freeze()
    } else {
        frame.payload
    };

    // Only inbound MSGs on channel 0 are new `<start>`/`<close>` requests
    // that need the registry-driven handler; a RPY/ERR on channel 0 is a
    // reply to a request *we* sent (via `Channel::send_msg` on channel 0
    // in `negotiate.rs`) and must complete that pending exchange the same
    // way a reply on any other channel would, via `Channel::on_frame`.
    if header.channel == 0 && header.msg_type == MsgType::Msg {
        let conn = conn.clone();
        let registry = registry.clone();
        let msgno = header.msgno;
        pool.run(move || async move {
            if let Err(e) =
                greeting::handle_one_channel_zero_request(&conn, &registry, msgno, &complete_payload)
                    .await
            {
                warn!(conn = conn.id.0, error = %e, "channel-0 request handling failed");
            }
        })
        .await;
        return Ok(());
    }

    let Some(channel) = conn.get_channel(header.channel) else {
        debug!(channel = header.channel, "frame for unknown channel, dropping");
        return Ok(());
    };
    channel
        .on_frame(header.msg_type, header.msgno, header.ansno, complete_payload)
        .await
}
