// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Incremental frame decoder.
//!
//! The codec is transport-agnostic: it only ever consumes bytes that
//! have already landed in a `BytesMut` scratch buffer (fed by whatever
//! the caller's read loop looks like) and never performs I/O itself.
//! This mirrors the teacher's split between "read bytes into a
//! scratch buffer" and "interpret the scratch buffer as a PDU".

use bytes::{Buf, Bytes, BytesMut};

use crate::{
    error::{BeepError, Result},
    frame::header::{FrameHeader, SeqFrame},
};

const TRAILER: &[u8] = b"END\r\n";

/// A fully decoded frame: header plus the raw payload bytes (MIME
/// headers, if any, are still embedded in `payload` — `mime` module
/// splits them out later).
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

/// Result of attempting to decode one frame out of the scratch buffer.
pub enum DecodeOutcome {
    /// A full frame was decoded and `buf` was advanced past it.
    Frame(Frame),
    /// A `SEQ` flow-control update was decoded and `buf` was advanced
    /// past it. Carries no payload, so there's nothing to reassemble.
    Seq(SeqFrame),
    /// Not enough bytes are buffered yet; the caller should read more
    /// and retry. `buf` is left untouched.
    NeedMore,
}

/// Stateless frame encoder/decoder bound to a connection's negotiated
/// frame-size ceiling.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: u32,
}

impl FrameCodec {
    pub fn new(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }

    /// Encodes one frame (header line + payload + `END\r\n` trailer).
    pub fn encode(&self, header: &FrameHeader, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() as u64 != header.size as u64 {
            return Err(BeepError::Protocol(
                "encode: payload length does not match header.size".into(),
            ));
        }
        if header.size > self.max_frame_size {
            return Err(BeepError::Protocol(format!(
                "encode: frame size {} exceeds negotiated maximum {}",
                header.size, self.max_frame_size
            )));
        }

        let head = header.encode();
        let mut out = Vec::with_capacity(head.len() + payload.len() + TRAILER.len());
        out.extend_from_slice(&head);
        out.extend_from_slice(payload);
        out.extend_from_slice(TRAILER);
        Ok(out)
    }

    /// Encodes a `SEQ` flow-control frame: just the header line, no
    /// payload and no `END\r\n` trailer (RFC 3081 §2.2.1.2).
    pub fn encode_seq(&self, seq: &SeqFrame) -> Vec<u8> {
        seq.encode()
    }

    /// Attempts to decode one frame from the front of `buf`.
    ///
    /// On success the consumed bytes (header line, payload, trailer)
    /// are removed from `buf`. On `NeedMore` nothing is consumed, so
    /// the caller can append more bytes and call again.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<DecodeOutcome> {
        let Some(header_end) = find_crlf(buf) else {
            if buf.len() > 4096 {
                return Err(BeepError::Protocol(
                    "frame header line exceeds sane length without CRLF".into(),
                ));
            }
            return Ok(DecodeOutcome::NeedMore);
        };

        let line = std::str::from_utf8(&buf[..header_end])
            .map_err(|_| BeepError::Protocol("frame header line is not ASCII".into()))?;

        if line.starts_with("SEQ ") || line == "SEQ" {
            let seq = SeqFrame::parse(line)?;
            buf.advance(header_end + 2);
            return Ok(DecodeOutcome::Seq(seq));
        }

        let header = FrameHeader::parse(line)?;

        if header.size > self.max_frame_size {
            return Err(BeepError::Protocol(format!(
                "frame size {} exceeds negotiated maximum {}",
                header.size, self.max_frame_size
            )));
        }

        let payload_start = header_end + 2;
        let payload_end = payload_start + header.size as usize;
        let frame_end = payload_end + TRAILER.len();

        if buf.len() < frame_end {
            return Ok(DecodeOutcome::NeedMore);
        }

        if &buf[payload_end..frame_end] != TRAILER {
            return Err(BeepError::Protocol(
                "frame missing END\\r\\n trailer at declared size".into(),
            ));
        }

        let mut consumed = buf.split_to(frame_end);
        consumed.advance(payload_start);
        consumed.truncate(header.size as usize);
        let payload = consumed.freeze();

        Ok(DecodeOutcome::Frame(Frame { header, payload }))
    }
}

fn find_crlf(buf: &BytesMut) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_single_frame() {
        let codec = FrameCodec::new(64 * 1024);
        let mut buf = BytesMut::from(&b"MSG 1 0 . 0 5\r\nhelloEND\r\n"[..]);
        match codec.decode(&mut buf).unwrap() {
            DecodeOutcome::Frame(f) => {
                assert_eq!(f.header.channel, 1);
                assert_eq!(&f.payload[..], b"hello");
                assert!(buf.is_empty());
            },
            _ => panic!("expected a full frame"),
        }
    }

    #[test]
    fn needs_more_on_partial_header() {
        let codec = FrameCodec::new(64 * 1024);
        let mut buf = BytesMut::from(&b"MSG 1 0 . 0 5"[..]);
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            DecodeOutcome::NeedMore
        ));
        assert_eq!(buf.len(), 13);
    }

    #[test]
    fn needs_more_on_partial_payload() {
        let codec = FrameCodec::new(64 * 1024);
        let mut buf = BytesMut::from(&b"MSG 1 0 . 0 5\r\nhel"[..]);
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            DecodeOutcome::NeedMore
        ));
    }

    #[test]
    fn feeding_one_byte_at_a_time_eventually_yields_a_frame() {
        let codec = FrameCodec::new(64 * 1024);
        let whole = b"RPY 1 0 . 0 2\r\nhiEND\r\n";
        let mut buf = BytesMut::new();
        let mut frame = None;
        for &b in whole {
            buf.extend_from_slice(&[b]);
            if let DecodeOutcome::Frame(f) = codec.decode(&mut buf).unwrap() {
                frame = Some(f);
                break;
            }
        }
        let frame = frame.expect("frame should have been decoded");
        assert_eq!(&frame.payload[..], b"hi");
    }

    #[test]
    fn rejects_missing_trailer() {
        let codec = FrameCodec::new(64 * 1024);
        let mut buf = BytesMut::from(&b"MSG 1 0 . 0 5\r\nhelloXXXXX"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_oversize_frame() {
        let codec = FrameCodec::new(16);
        let mut buf = BytesMut::from(&b"MSG 1 0 . 0 100\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn encode_round_trips_through_decode() {
        let codec = FrameCodec::new(64 * 1024);
        let header = FrameHeader {
            msg_type: crate::frame::header::MsgType::Ans,
            channel: 2,
            msgno: 9,
            more: false,
            seqno: 10,
            size: 3,
            ansno: Some(1),
        };
        let wire = codec.encode(&header, b"abc").unwrap();
        let mut buf = BytesMut::from(&wire[..]);
        let DecodeOutcome::Frame(f) = codec.decode(&mut buf).unwrap() else {
            panic!("expected frame")
        };
        assert_eq!(f.header, header);
    }

    #[test]
    fn decodes_seq_frame_with_no_trailer() {
        let codec = FrameCodec::new(64 * 1024);
        let mut buf = BytesMut::from(&b"SEQ 1 52 8192\r\nMSG 3 0 . 0 1\r\nxEND\r\n"[..]);
        let DecodeOutcome::Seq(seq) = codec.decode(&mut buf).unwrap() else {
            panic!("expected a SEQ frame")
        };
        assert_eq!(seq.channel, 1);
        assert_eq!(seq.ackno, 52);
        assert_eq!(seq.window, 8192);
        // The next frame in the buffer is untouched by SEQ decoding.
        let DecodeOutcome::Frame(f) = codec.decode(&mut buf).unwrap() else {
            panic!("expected the following MSG frame")
        };
        assert_eq!(f.header.channel, 3);
    }

    #[test]
    fn encode_seq_round_trips_through_decode() {
        let codec = FrameCodec::new(64 * 1024);
        let seq = crate::frame::header::SeqFrame { channel: 7, ackno: 0, window: 4096 };
        let mut buf = BytesMut::from(&codec.encode_seq(&seq)[..]);
        let DecodeOutcome::Seq(decoded) = codec.decode(&mut buf).unwrap() else {
            panic!("expected a SEQ frame")
        };
        assert_eq!(decoded, seq);
        assert!(buf.is_empty());
    }
}
