// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::debug;

use crate::{
    channel::sequencer::{SeqAllocator, SendWindow, chunk_payload},
    connection::conn::Connection,
    error::{BeepError, Result},
    frame::{FrameHeader, MimeHeaders, MsgType, SeqFrame, split_mime},
};

/// Lifecycle state of a channel (§3, Channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// `start` has been sent/received but not yet acknowledged.
    Starting,
    /// Normal message exchange is permitted.
    Active,
    /// `close` has been sent/received; only in-flight replies may
    /// still be delivered.
    Closing,
    Closed,
}

/// One complete inbound message delivered to the channel's consumer.
#[derive(Debug, Clone)]
pub struct InboundMsg {
    pub msgno: u32,
    pub mime: MimeHeaders,
    pub payload: Bytes,
}

/// The outcome of a `MSG` the local side sent and waited on.
#[derive(Debug, Clone)]
pub enum ExchangeReply {
    Rpy { mime: MimeHeaders, payload: Bytes },
    Err { code: u16, message: String },
}

/// One fragment of an `ANS` stream, or the terminating `NUL`.
#[derive(Debug, Clone)]
pub enum AnsEvent {
    Fragment { ansno: u32, mime: MimeHeaders, payload: Bytes },
    Done,
}

enum PendingExchange {
    Single(oneshot::Sender<ExchangeReply>),
    Stream(mpsc::Sender<AnsEvent>),
}

/// A single multiplexed BEEP channel (§3, Channel; §4.2/§4.4).
pub struct Channel {
    pub number: u32,
    pub profile: String,
    conn: Weak<Connection>,

    state: Mutex<ChannelState>,
    pub serialize: AtomicBool,

    next_msgno_to_send: AtomicU32,
    send_seq: SeqAllocator,
    recv_seq: SeqAllocator,
    send_window: SendWindow,
    /// What we advertise to the peer for frames it sends us.
    recv_window_size: u32,
    /// Octets received on this channel since the last `SEQ` we emitted
    /// (§4.4's "SEQ update emission"). Reset to 0 each time the
    /// half-window threshold fires.
    recv_since_last_seq: AtomicU32,

    pending: DashMap<u32, PendingExchange>,
    inbound_tx: mpsc::Sender<InboundMsg>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMsg>>>,

    /// Next msgno whose reply may be delivered to its waiter, when
    /// `serialize` is set. Replies that arrive ahead of their turn sit
    /// in `reply_reorder` until the gap closes (§8 property 3).
    next_reply_to_deliver: AtomicU32,
    reply_reorder: Mutex<std::collections::BTreeMap<u32, ExchangeReply>>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("number", &self.number)
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// `initial_send_window` is this side's assumption about how much
    /// it may send before hearing otherwise: RFC 3081 leaves the
    /// window unspecified until the first `SEQ` arrives, so both peers
    /// start from the locally-configured `default_window` (§9 open
    /// question: "behavior ... is not documented" resolved here by
    /// assuming symmetric configuration until a real `SEQ` corrects
    /// it).
    pub fn new(
        number: u32,
        profile: String,
        conn: Weak<Connection>,
        serialize: bool,
        recv_window_size: u32,
        initial_send_window: u32,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(32);
        Arc::new(Self {
            number,
            profile,
            conn,
            state: Mutex::new(ChannelState::Starting),
            serialize: AtomicBool::new(serialize),
            next_msgno_to_send: AtomicU32::new(0),
            send_seq: SeqAllocator::new(0),
            recv_seq: SeqAllocator::new(0),
            send_window: SendWindow::new(initial_send_window),
            recv_window_size,
            recv_since_last_seq: AtomicU32::new(0),
            pending: DashMap::new(),
            inbound_tx: tx,
            inbound_rx: Mutex::new(Some(rx)),
            next_reply_to_deliver: AtomicU32::new(0),
            reply_reorder: Mutex::new(std::collections::BTreeMap::new()),
        })
    }

    pub async fn set_state(&self, state: ChannelState) {
        *self.state.lock().await = state;
    }

    pub async fn state(&self) -> ChannelState {
        *self.state.lock().await
    }

    pub fn outstanding_count(&self) -> usize {
        self.pending.len()
    }

    /// Waits until no local message is awaiting a reply on this
    /// channel, or `max_wait` elapses. Used by the `close_pending_policy
    /// = Wait` path (§4.2) to defer completing a `<close>` until every
    /// outstanding reply has been delivered.
    pub async fn wait_until_drained(&self, max_wait: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if self.outstanding_count() == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BeepError::TimeoutError(format!(
                    "close-pending drain timeout on channel {}: {} outstanding replies",
                    self.number,
                    self.outstanding_count()
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn advertised_recv_window(&self) -> u32 {
        self.recv_window_size
    }

    /// Takes ownership of the inbound-message stream. May only be
    /// called once; later callers get `None` (the profile handler
    /// that owns the channel is expected to hold on to the receiver
    /// for its whole lifetime).
    pub async fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMsg>> {
        self.inbound_rx.lock().await.take()
    }

    /// The connection this channel lives on, if it hasn't been dropped
    /// yet. Used by callbacks (e.g. the tuning reset manager) that are
    /// only handed the channel itself.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.conn.upgrade()
    }

    fn conn(&self) -> Result<Arc<Connection>> {
        self.conn
            .upgrade()
            .ok_or_else(|| BeepError::Protocol("connection has been dropped".into()))
    }

    /// Applies an inbound `SEQ` to this channel's outgoing flow
    /// control (§4.4, §4.1): the peer has told us how much more we may
    /// send it.
    pub(crate) fn apply_seq(&self, seq: &SeqFrame) -> Result<()> {
        self.send_window.update_from_seq(seq.window)
    }

    /// Accounts `len` octets of payload just received on the wire for
    /// this channel (counted per raw frame, before fragment
    /// reassembly, since flow control operates on wire bytes) and, once
    /// the configurable half-window threshold is crossed, emits a
    /// `SEQ` update advertising a fresh window (§4.4).
    pub(crate) async fn note_wire_bytes_received(&self, len: u32) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.recv_seq.reserve(len);
        let since = self.recv_since_last_seq.fetch_add(len, Ordering::SeqCst) + len;
        let threshold = (self.recv_window_size / 2).max(1);
        if since < threshold {
            return Ok(());
        }
        self.recv_since_last_seq.store(0, Ordering::SeqCst);

        let ackno = self.recv_seq.current();
        let seq = SeqFrame { channel: self.number, ackno, window: self.recv_window_size };
        let conn = self.conn()?;
        let wire = conn.codec.encode_seq(&seq);
        conn.write_frame(&wire).await
    }

    async fn write_one(
        &self,
        msg_type: MsgType,
        msgno: u32,
        ansno: Option<u32>,
        payload: &[u8],
    ) -> Result<()> {
        let conn = self.conn()?;
        let max_frame = conn.cfg.frame.max_frame_size as usize;
        let chunks = chunk_payload(payload, max_frame);
        let last = chunks.len() - 1;

        for (i, chunk) in chunks.into_iter().enumerate() {
            let more = i != last;
            let seqno = self.send_seq.reserve(chunk.len() as u32);
            self.send_window.consume(chunk.len() as u32)?;

            let header = FrameHeader {
                msg_type,
                channel: self.number,
                msgno,
                more,
                seqno,
                size: chunk.len() as u32,
                ansno,
            };
            let wire = conn.codec.encode(&header, chunk)?;
            conn.write_frame(&wire).await?;
        }
        Ok(())
    }

    /// Sends a `MSG` and waits for a single `RPY` or `ERR`. Callers
    /// that expect an `ANS`/`NUL` stream should use
    /// [`Channel::send_msg_expect_answers`] instead.
    pub async fn send_msg(&self, mime: Option<&MimeHeaders>, body: &[u8]) -> Result<ExchangeReply> {
        let msgno = self.next_msgno_to_send.fetch_add(1, Ordering::SeqCst);
        let payload = with_mime(mime, body);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(msgno, PendingExchange::Single(tx));

        if let Err(e) = self.write_one(MsgType::Msg, msgno, None, &payload).await {
            self.pending.remove(&msgno);
            return Err(e);
        }

        rx.await
            .map_err(|_| BeepError::Protocol("channel closed before a reply arrived".into()))
    }

    /// Sends a `MSG` expecting an `ANS`* `NUL` stream in reply.
    pub async fn send_msg_expect_answers(
        &self,
        mime: Option<&MimeHeaders>,
        body: &[u8],
    ) -> Result<mpsc::Receiver<AnsEvent>> {
        let msgno = self.next_msgno_to_send.fetch_add(1, Ordering::SeqCst);
        let payload = with_mime(mime, body);

        let (tx, rx) = mpsc::channel(32);
        self.pending.insert(msgno, PendingExchange::Stream(tx));

        if let Err(e) = self.write_one(MsgType::Msg, msgno, None, &payload).await {
            self.pending.remove(&msgno);
            return Err(e);
        }
        Ok(rx)
    }

    pub async fn reply_rpy(&self, msgno: u32, mime: Option<&MimeHeaders>, body: &[u8]) -> Result<()> {
        let payload = with_mime(mime, body);
        self.write_one(MsgType::Rpy, msgno, None, &payload).await
    }

    pub async fn reply_err(&self, msgno: u32, code: u16, message: &str) -> Result<()> {
        let body = format!(
            "<error code='{code}'>{}</error>",
            xml_escape(message)
        );
        self.write_one(MsgType::Err, msgno, None, body.as_bytes())
            .await
    }

    pub async fn reply_ans(
        &self,
        msgno: u32,
        ansno: u32,
        mime: Option<&MimeHeaders>,
        body: &[u8],
    ) -> Result<()> {
        let payload = with_mime(mime, body);
        self.write_one(MsgType::Ans, msgno, Some(ansno), &payload)
            .await
    }

    pub async fn reply_nul(&self, msgno: u32) -> Result<()> {
        self.write_one(MsgType::Nul, msgno, None, &[]).await
    }

    /// Invoked by the reader loop (C6) with a frame addressed to this
    /// channel. Reassembly across `more` fragments is the caller's
    /// responsibility; this is handed a complete message payload.
    pub(crate) async fn on_frame(
        &self,
        msg_type: MsgType,
        msgno: u32,
        ansno: Option<u32>,
        payload: Bytes,
    ) -> Result<()> {
        match msg_type {
            MsgType::Msg => {
                let (mime, body) = split_mime(&payload);
                let msg = InboundMsg { msgno, mime, payload: body };
                self.inbound_tx.send(msg).await.map_err(|_| {
                    BeepError::Protocol("no consumer for inbound MSG".into())
                })?;
            },
            MsgType::Rpy => {
                let (mime, body) = split_mime(&payload);
                self.complete_single(msgno, ExchangeReply::Rpy { mime, payload: body })
                    .await?;
            },
            MsgType::Err => {
                let (code, message) = parse_error_element(&payload);
                self.complete_single(msgno, ExchangeReply::Err { code, message })
                    .await?;
            },
            MsgType::Ans => {
                let ansno = ansno.ok_or_else(|| {
                    BeepError::Protocol("ANS frame delivered without ansno".into())
                })?;
                let (mime, body) = split_mime(&payload);
                self.forward_stream(
                    msgno,
                    AnsEvent::Fragment { ansno, mime, payload: body },
                )
                .await?;
            },
            MsgType::Nul => {
                self.forward_stream(msgno, AnsEvent::Done).await?;
                self.pending.remove(&msgno);
            },
        }
        Ok(())
    }

    async fn complete_single(&self, msgno: u32, reply: ExchangeReply) -> Result<()> {
        if self.serialize.load(Ordering::Acquire) {
            self.deliver_serialized(msgno, reply).await
        } else {
            self.deliver_one(msgno, reply)
        }
    }

    fn deliver_one(&self, msgno: u32, reply: ExchangeReply) -> Result<()> {
        match self.pending.remove(&msgno) {
            Some((_, PendingExchange::Single(tx))) => {
                let _ = tx.send(reply);
                Ok(())
            },
            Some((_, PendingExchange::Stream(_))) => Err(BeepError::Protocol(format!(
                "received RPY/ERR for msgno {msgno} that expected an ANS stream"
            ))),
            None => {
                debug!("reply for unknown msgno {msgno} (late or duplicate)");
                Ok(())
            },
        }
    }

    /// Holds `reply` until every lower msgno sent on this channel has
    /// already been delivered, then flushes as many in-order entries
    /// as are now ready. This is what makes `serialize = true` mean
    /// "replies reach the application in ascending msgno order" even
    /// when the peer answers out of order.
    async fn deliver_serialized(&self, msgno: u32, reply: ExchangeReply) -> Result<()> {
        let mut buffered = self.reply_reorder.lock().await;
        buffered.insert(msgno, reply);
        loop {
            let next = self.next_reply_to_deliver.load(Ordering::Acquire);
            let Some(ready) = buffered.remove(&next) else {
                break;
            };
            self.deliver_one(next, ready)?;
            self.next_reply_to_deliver.store(next + 1, Ordering::Release);
        }
        Ok(())
    }

    async fn forward_stream(&self, msgno: u32, event: AnsEvent) -> Result<()> {
        let Some(entry) = self.pending.get(&msgno) else {
            debug!("ANS/NUL for unknown msgno {msgno} (late or duplicate)");
            return Ok(());
        };
        match entry.value() {
            PendingExchange::Stream(tx) => {
                let tx = tx.clone();
                drop(entry);
                let _ = tx.send(event).await;
                Ok(())
            },
            PendingExchange::Single(_) => Err(BeepError::Protocol(format!(
                "received ANS/NUL for msgno {msgno} that expected a single RPY/ERR"
            ))),
        }
    }
}

fn with_mime(mime: Option<&MimeHeaders>, body: &[u8]) -> Vec<u8> {
    let Some(mime) = mime else {
        return body.to_vec();
    };
    let mut out = Vec::new();
    if let Some(ct) = &mime.content_type {
        out.extend_from_slice(format!("Content-Type: {ct}\r\n").as_bytes());
    }
    if let Some(cte) = &mime.content_transfer_encoding {
        out.extend_from_slice(format!("Content-Transfer-Encoding: {cte}\r\n").as_bytes());
    }
    for (k, v) in &mime.other {
        out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
    }
    // An empty `MimeHeaders` (e.g. one `split_mime` produced from a
    // payload with no MIME block at all) must round-trip back to a
    // bare body — a blank-line separator with no headers before it is
    // itself a zero-length header block, not "no headers".
    if out.is_empty() {
        return body.to_vec();
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

/// Pulls `code`/body text out of a `<error code='...'>...</error>`
/// element without a general XML parser — the grammar is fixed and
/// small enough that a dedicated scan is clearer than a dependency.
fn parse_error_element(payload: &[u8]) -> (u16, String) {
    let (_, body) = split_mime(&Bytes::copy_from_slice(payload));
    let text = String::from_utf8_lossy(&body);
    let code = text
        .split("code='")
        .nth(1)
        .or_else(|| text.split("code=\"").nth(1))
        .and_then(|rest| rest.split(['\'', '"']).next())
        .and_then(|digits| digits.parse::<u16>().ok())
        .unwrap_or(550);
    let message = text
        .split_once('>')
        .map(|(_, rest)| rest.trim_end_matches("</error>").trim().to_string())
        .unwrap_or_default();
    (code, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_error_element() {
        let (code, msg) = parse_error_element(b"<error code='550'>no such channel</error>");
        assert_eq!(code, 550);
        assert_eq!(msg, "no such channel");
    }

    #[test]
    fn with_mime_prepends_content_type() {
        let mime = MimeHeaders {
            content_type: Some("application/beep+xml".into()),
            ..Default::default()
        };
        let out = with_mime(Some(&mime), b"<start/>");
        assert!(out.starts_with(b"Content-Type: application/beep+xml\r\n\r\n<start/>"));
    }

    #[test]
    fn xml_escape_covers_entities() {
        assert_eq!(xml_escape("a<b>&\"'"), "a&lt;b&gt;&amp;&quot;&apos;");
    }

    /// §8 property 3 / scenario S3: out-of-order RPYs on a
    /// `serialize = true` channel must still reach their waiters in
    /// ascending msgno order.
    #[tokio::test]
    async fn serialize_true_delivers_replies_in_ascending_order() {
        let channel = Channel::new(1, "test".into(), Weak::new(), true, 4096, 4096);

        let mut receivers = Vec::new();
        for msgno in 0..3u32 {
            let (tx, rx) = oneshot::channel();
            channel.pending.insert(msgno, PendingExchange::Single(tx));
            receivers.push(rx);
        }

        for &msgno in &[2u32, 0, 1] {
            channel
                .on_frame(
                    MsgType::Rpy,
                    msgno,
                    None,
                    Bytes::from(format!("reply-{msgno}")),
                )
                .await
                .unwrap();
        }

        for (expected_msgno, rx) in receivers.into_iter().enumerate() {
            match rx.await.unwrap() {
                ExchangeReply::Rpy { payload, .. } => {
                    assert_eq!(payload, Bytes::from(format!("reply-{expected_msgno}")));
                },
                ExchangeReply::Err { .. } => panic!("unexpected error reply"),
            }
        }
    }
}
