// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The ASCII header line carried by every BEEP frame.
//!
//! ```text
//! MSG 0 1 . 52 120\r\n
//! ^   ^ ^ ^ ^  ^
//! |   | | | |  size
//! |   | | | seqno
//! |   | | more
//! |   | msgno
//! |   channel
//! msg-type
//! ```
//!
//! `ANS` carries a trailing `ansno` token; every other message type
//! does not.

use core::fmt;

use crate::error::{BeepError, Result};

/// The five BEEP message types (RFC 3081 §2.2.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Msg,
    Rpy,
    Err,
    Ans,
    Nul,
}

impl MsgType {
    fn as_token(self) -> &'static str {
        match self {
            MsgType::Msg => "MSG",
            MsgType::Rpy => "RPY",
            MsgType::Err => "ERR",
            MsgType::Ans => "ANS",
            MsgType::Nul => "NUL",
        }
    }

    fn from_token(tok: &str) -> Result<Self> {
        Ok(match tok {
            "MSG" => MsgType::Msg,
            "RPY" => MsgType::Rpy,
            "ERR" => MsgType::Err,
            "ANS" => MsgType::Ans,
            "NUL" => MsgType::Nul,
            other => {
                return Err(BeepError::Protocol(format!(
                    "unknown message type {other:?}"
                )));
            },
        })
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

/// A parsed header line, decoupled from the payload bytes that follow
/// it on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: MsgType,
    pub channel: u32,
    pub msgno: u32,
    /// `true` when this is a continuation frame (`*`); `false` marks
    /// the final frame of a message (`.`).
    pub more: bool,
    pub seqno: u32,
    pub size: u32,
    /// Only present on `ANS` frames.
    pub ansno: Option<u32>,
}

const MAX_CHANNEL: u32 = 2_147_483_647;
const MAX_MSGNO: u32 = 2_147_483_647;

impl FrameHeader {
    /// Renders the header line, including the trailing `\r\n`.
    pub fn encode(&self) -> Vec<u8> {
        let more = if self.more { '*' } else { '.' };
        let mut line = format!(
            "{} {} {} {} {} {}",
            self.msg_type, self.channel, self.msgno, more, self.seqno, self.size
        );
        if let Some(ansno) = self.ansno {
            line.push(' ');
            line.push_str(&ansno.to_string());
        }
        line.push_str("\r\n");
        line.into_bytes()
    }

    /// Parses one header line (without the trailing `\r\n`, which the
    /// caller has already stripped while scanning for the line break).
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split(' ').filter(|s| !s.is_empty());

        let msg_type = MsgType::from_token(parts.next().ok_or_else(|| {
            BeepError::Protocol("empty frame header line".into())
        })?)?;

        let channel = parse_u32(parts.next(), "channel")?;
        if channel > MAX_CHANNEL {
            return Err(BeepError::Protocol(format!(
                "channel number {channel} exceeds maximum"
            )));
        }

        let msgno = parse_u32(parts.next(), "msgno")?;
        if msgno > MAX_MSGNO {
            return Err(BeepError::Protocol(format!(
                "msgno {msgno} exceeds maximum"
            )));
        }

        let more = match parts.next() {
            Some(".") => false,
            Some("*") => true,
            Some(other) => {
                return Err(BeepError::Protocol(format!(
                    "invalid more-token {other:?}"
                )));
            },
            None => return Err(BeepError::Protocol("missing more-token".into())),
        };

        let seqno = parse_u32(parts.next(), "seqno")?;
        let size = parse_u32(parts.next(), "size")?;

        let ansno = match (msg_type, parts.next()) {
            (MsgType::Ans, Some(tok)) => Some(parse_u32_str(tok, "ansno")?),
            (MsgType::Ans, None) => {
                return Err(BeepError::Protocol("ANS frame missing ansno".into()));
            },
            (_, None) => None,
            (_, Some(extra)) => {
                return Err(BeepError::Protocol(format!(
                    "unexpected trailing token {extra:?}"
                )));
            },
        };

        if parts.next().is_some() {
            return Err(BeepError::Protocol(
                "trailing garbage after header line".into(),
            ));
        }

        Ok(FrameHeader {
            msg_type,
            channel,
            msgno,
            more,
            seqno,
            size,
            ansno,
        })
    }
}

/// A `SEQ` frame: flow-control only, no payload, no `END\r\n` trailer
/// — its wire shape is the three-token line RFC 3081 §2.2.1.2 defines
/// (`SEQ channel ackno window\r\n`), not the generic `TYPE CHAN MSGNO
/// MORE SEQNO SIZE` header the other five message types share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqFrame {
    pub channel: u32,
    pub ackno: u32,
    pub window: u32,
}

impl SeqFrame {
    pub fn encode(&self) -> Vec<u8> {
        format!("SEQ {} {} {}\r\n", self.channel, self.ackno, self.window).into_bytes()
    }

    /// Parses a line already identified as starting with the `SEQ`
    /// token (without the trailing `\r\n`).
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split(' ').filter(|s| !s.is_empty());
        let tok = parts.next().ok_or_else(|| BeepError::Protocol("empty SEQ line".into()))?;
        if tok != "SEQ" {
            return Err(BeepError::Protocol(format!("expected SEQ, got {tok:?}")));
        }
        let channel = parse_u32(parts.next(), "channel")?;
        let ackno = parse_u32(parts.next(), "ackno")?;
        let window = parse_u32(parts.next(), "window")?;
        if parts.next().is_some() {
            return Err(BeepError::Protocol("trailing garbage after SEQ line".into()));
        }
        Ok(SeqFrame { channel, ackno, window })
    }
}

fn parse_u32(tok: Option<&str>, field: &str) -> Result<u32> {
    parse_u32_str(
        tok.ok_or_else(|| BeepError::Protocol(format!("missing {field}")))?,
        field,
    )
}

fn parse_u32_str(tok: &str, field: &str) -> Result<u32> {
    if tok.is_empty() || !tok.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BeepError::Protocol(format!("invalid {field} {tok:?}")));
    }
    tok.parse::<u32>()
        .map_err(|_| BeepError::Protocol(format!("{field} {tok:?} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_msg() {
        let hdr = FrameHeader {
            msg_type: MsgType::Msg,
            channel: 1,
            msgno: 7,
            more: false,
            seqno: 52,
            size: 120,
            ansno: None,
        };
        let encoded = hdr.encode();
        assert_eq!(encoded, b"MSG 1 7 . 52 120\r\n");
        let line = std::str::from_utf8(&encoded[..encoded.len() - 2]).unwrap();
        assert_eq!(FrameHeader::parse(line).unwrap(), hdr);
    }

    #[test]
    fn ans_requires_ansno() {
        assert!(FrameHeader::parse("ANS 1 2 . 3 4").is_err());
        let hdr = FrameHeader::parse("ANS 1 2 . 3 4 9").unwrap();
        assert_eq!(hdr.ansno, Some(9));
    }

    #[test]
    fn rejects_bad_more_token() {
        assert!(FrameHeader::parse("MSG 1 2 x 3 4").is_err());
    }

    #[test]
    fn rejects_non_numeric_fields() {
        assert!(FrameHeader::parse("MSG one 2 . 3 4").is_err());
    }

    #[test]
    fn seq_frame_round_trips() {
        let seq = SeqFrame { channel: 1, ackno: 52, window: 8192 };
        let encoded = seq.encode();
        assert_eq!(encoded, b"SEQ 1 52 8192\r\n");
        let line = std::str::from_utf8(&encoded[..encoded.len() - 2]).unwrap();
        assert_eq!(SeqFrame::parse(line).unwrap(), seq);
    }

    #[test]
    fn seq_frame_rejects_wrong_token() {
        assert!(SeqFrame::parse("MSG 1 52 8192").is_err());
    }
}
