// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A hand-written recursive-descent reader for the fixed, tiny channel-0
//! management dialect (RFC 3080 §2.3): `<greeting>`, `<start>`,
//! `<close>`, `<ok/>`, `<error>`, and the `<profile>` element nested in
//! the first two. Per the design note in §9 of the spec, the grammar
//! is small and fixed-shape enough that a general XML dependency would
//! buy nothing over scanning the five known tags directly.

use crate::error::{BeepError, Result};

/// One `<profile uri=… [encoding=…]>CDATA</profile>` element, either
/// advertised in a greeting or carried as the payload of a `<start>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileAd {
    pub uri: String,
    pub encoding: Option<String>,
    /// Piggy-backed content, already base64-decoded if `encoding` was
    /// `base64`. `None` when the element was empty or self-closing.
    pub content: Option<Vec<u8>>,
}

/// A single parsed channel-0 management element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelZeroMsg {
    Greeting {
        profiles: Vec<ProfileAd>,
        features: Option<String>,
        localize: Option<String>,
    },
    Start {
        number: u32,
        server_name: Option<String>,
        profiles: Vec<ProfileAd>,
    },
    Close {
        number: u32,
        code: u16,
    },
    /// A standalone `<profile>` element: the success reply to a
    /// `<start>`, distinct from the `<start>` request itself.
    Profile(ProfileAd),
    Ok,
    Error {
        code: u16,
        message: String,
    },
}

impl ChannelZeroMsg {
    pub fn parse(input: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(input)
            .map_err(|_| BeepError::Protocol("channel-0 payload is not valid UTF-8".into()))?;
        let mut p = Parser::new(text);
        let (name, attrs, self_closing) = p.parse_open_tag()?;
        match name.as_str() {
            "profile" => {
                let uri = attrs
                    .get("uri")
                    .ok_or_else(|| BeepError::Protocol("<profile> missing uri".into()))?
                    .clone();
                let encoding = attrs.get("encoding").cloned();
                let content = if self_closing {
                    None
                } else {
                    let text = p.parse_text_until_close("profile")?;
                    if text.is_empty() {
                        None
                    } else if encoding.as_deref() == Some("base64") {
                        Some(base64_decode(&text)?)
                    } else {
                        Some(text.into_bytes())
                    }
                };
                Ok(ChannelZeroMsg::Profile(ProfileAd { uri, encoding, content }))
            },
            "greeting" => {
                let features = attrs.get("features").cloned();
                let localize = attrs.get("localize").cloned();
                let profiles = p.parse_profile_list("greeting")?;
                Ok(ChannelZeroMsg::Greeting { profiles, features, localize })
            },
            "start" => {
                let number = parse_required_u32(&attrs, "number")?;
                let server_name = attrs.get("serverName").cloned();
                let profiles = p.parse_profile_list("start")?;
                if profiles.is_empty() {
                    return Err(BeepError::Protocol(
                        "<start> must carry at least one <profile>".into(),
                    ));
                }
                Ok(ChannelZeroMsg::Start { number, server_name, profiles })
            },
            "close" => {
                let number = parse_required_u32(&attrs, "number")?;
                let code = attrs
                    .get("code")
                    .ok_or_else(|| BeepError::Protocol("<close> missing code".into()))?
                    .parse::<u16>()
                    .map_err(|_| BeepError::Protocol("<close> code is not numeric".into()))?;
                p.expect_close("close")?;
                Ok(ChannelZeroMsg::Close { number, code })
            },
            "ok" => {
                // <ok/> is always self-closing; nothing further to parse.
                Ok(ChannelZeroMsg::Ok)
            },
            "error" => {
                let code = attrs
                    .get("code")
                    .ok_or_else(|| BeepError::Protocol("<error> missing code".into()))?
                    .parse::<u16>()
                    .map_err(|_| BeepError::Protocol("<error> code is not numeric".into()))?;
                let message = p.parse_text_until_close("error")?;
                Ok(ChannelZeroMsg::Error { code, message })
            },
            other => Err(BeepError::Protocol(format!("unknown channel-0 element <{other}>"))),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            ChannelZeroMsg::Greeting { profiles, features, localize } => {
                let mut out = String::from("<greeting");
                if let Some(f) = features {
                    out.push_str(&format!(" features='{}'", escape_attr(f)));
                }
                if let Some(l) = localize {
                    out.push_str(&format!(" localize='{}'", escape_attr(l)));
                }
                if profiles.is_empty() {
                    out.push_str(" />");
                } else {
                    out.push('>');
                    for p in profiles {
                        out.push_str(&render_profile(p));
                    }
                    out.push_str("</greeting>");
                }
                out.into_bytes()
            },
            ChannelZeroMsg::Start { number, server_name, profiles } => {
                let mut out = format!("<start number='{number}'");
                if let Some(sn) = server_name {
                    out.push_str(&format!(" serverName='{}'", escape_attr(sn)));
                }
                out.push('>');
                for p in profiles {
                    out.push_str(&render_profile(p));
                }
                out.push_str("</start>");
                out.into_bytes()
            },
            ChannelZeroMsg::Close { number, code } => {
                format!("<close number='{number}' code='{code}' />").into_bytes()
            },
            ChannelZeroMsg::Profile(ad) => render_profile(ad).into_bytes(),
            ChannelZeroMsg::Ok => b"<ok />".to_vec(),
            ChannelZeroMsg::Error { code, message } => {
                format!("<error code='{code}'>{}</error>", escape_text(message)).into_bytes()
            },
        }
    }
}

fn render_profile(p: &ProfileAd) -> String {
    let mut out = format!("<profile uri='{}'", escape_attr(&p.uri));
    if let Some(enc) = &p.encoding {
        out.push_str(&format!(" encoding='{}'", escape_attr(enc)));
    }
    match &p.content {
        Some(content) if !content.is_empty() => {
            out.push('>');
            if p.encoding.as_deref() == Some("base64") {
                out.push_str(&base64_encode(content));
            } else {
                out.push_str(&escape_text(&String::from_utf8_lossy(content)));
            }
            out.push_str("</profile>");
        },
        _ => out.push_str(" />"),
    }
    out
}

fn parse_required_u32(attrs: &std::collections::HashMap<String, String>, name: &str) -> Result<u32> {
    attrs
        .get(name)
        .ok_or_else(|| BeepError::Protocol(format!("missing {name} attribute")))?
        .parse::<u32>()
        .map_err(|_| BeepError::Protocol(format!("{name} attribute is not numeric")))
}

/// A minimal scanner over the fixed grammar: tag names are
/// `[a-zA-Z]+`, attribute values are single- or double-quoted, and
/// nesting is limited to one level of `<profile>` inside `<greeting>`
/// or `<start>`.
struct Parser<'a> {
    rest: &'a str,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { rest: input.trim() }
    }

    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start();
    }

    /// Parses `<name attr='v' ...>` or `<name attr='v' ... />`,
    /// returning the tag name, its attributes, and whether it was
    /// self-closing.
    fn parse_open_tag(&mut self) -> Result<(String, std::collections::HashMap<String, String>, bool)> {
        self.skip_ws();
        if !self.rest.starts_with('<') {
            return Err(BeepError::Protocol("expected '<' at start of element".into()));
        }
        self.rest = &self.rest[1..];
        let name_end = self
            .rest
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .ok_or_else(|| BeepError::Protocol("unterminated tag name".into()))?;
        let name = self.rest[..name_end].to_string();
        self.rest = &self.rest[name_end..];

        let mut attrs = std::collections::HashMap::new();
        loop {
            self.skip_ws();
            if let Some(after) = self.rest.strip_prefix("/>") {
                self.rest = after;
                return Ok((name, attrs, true));
            }
            if let Some(after) = self.rest.strip_prefix('>') {
                self.rest = after;
                return Ok((name, attrs, false));
            }
            let eq = self
                .rest
                .find('=')
                .ok_or_else(|| BeepError::Protocol(format!("malformed attribute in <{name}>")))?;
            let attr_name = self.rest[..eq].trim().to_string();
            self.rest = &self.rest[eq + 1..];
            self.skip_ws();
            let quote = self
                .rest
                .chars()
                .next()
                .filter(|c| *c == '\'' || *c == '"')
                .ok_or_else(|| {
                    BeepError::Protocol(format!("attribute {attr_name} is not quoted"))
                })?;
            self.rest = &self.rest[1..];
            let val_end = self
                .rest
                .find(quote)
                .ok_or_else(|| BeepError::Protocol(format!("unterminated {attr_name} value")))?;
            let value = unescape_text(&self.rest[..val_end]);
            self.rest = &self.rest[val_end + 1..];
            attrs.insert(attr_name, value);
        }
    }

    /// Parses zero or more `<profile>` elements up to the matching
    /// closing tag `</parent>`.
    fn parse_profile_list(&mut self, parent: &str) -> Result<Vec<ProfileAd>> {
        let mut out = Vec::new();
        loop {
            self.skip_ws();
            if self.rest.starts_with(&format!("</{parent}>")) {
                self.rest = &self.rest[format!("</{parent}>").len()..];
                return Ok(out);
            }
            if self.rest.is_empty() {
                return Ok(out);
            }
            let (name, attrs, self_closing) = self.parse_open_tag()?;
            if name != "profile" {
                return Err(BeepError::Protocol(format!(
                    "expected <profile> inside <{parent}>, found <{name}>"
                )));
            }
            let uri = attrs
                .get("uri")
                .ok_or_else(|| BeepError::Protocol("<profile> missing uri".into()))?
                .clone();
            let encoding = attrs.get("encoding").cloned();

            let content = if self_closing {
                None
            } else {
                let text = self.parse_text_until_close("profile")?;
                if text.is_empty() {
                    None
                } else if encoding.as_deref() == Some("base64") {
                    Some(base64_decode(&text)?)
                } else {
                    Some(text.into_bytes())
                }
            };
            out.push(ProfileAd { uri, encoding, content });
        }
    }

    fn parse_text_until_close(&mut self, tag: &str) -> Result<String> {
        let closing = format!("</{tag}>");
        let pos = self
            .rest
            .find(&closing)
            .ok_or_else(|| BeepError::Protocol(format!("missing closing </{tag}>")))?;
        let text = unescape_text(&self.rest[..pos]);
        self.rest = &self.rest[pos + closing.len()..];
        Ok(text)
    }

    fn expect_close(&mut self, tag: &str) -> Result<()> {
        self.skip_ws();
        let closing = format!("</{tag}>");
        if let Some(after) = self.rest.strip_prefix(&closing) {
            self.rest = after;
        }
        Ok(())
    }
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;").replace('\'', "&apos;").replace('<', "&lt;")
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn unescape_text(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

const B64: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

pub(crate) fn base64_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b0 = chunk[0];
        let b1 = chunk.get(1).copied();
        let b2 = chunk.get(2).copied();
        out.push(B64[(b0 >> 2) as usize] as char);
        out.push(B64[(((b0 & 0x03) << 4) | (b1.unwrap_or(0) >> 4)) as usize] as char);
        if let Some(b1) = b1 {
            out.push(B64[(((b1 & 0x0f) << 2) | (b2.unwrap_or(0) >> 6)) as usize] as char);
        } else {
            out.push('=');
        }
        if let Some(b2) = b2 {
            out.push(B64[(b2 & 0x3f) as usize] as char);
        } else {
            out.push('=');
        }
    }
    out
}

pub(crate) fn base64_decode(s: &str) -> Result<Vec<u8>> {
    fn val(c: u8) -> Option<u8> {
        match c {
            b'A'..=b'Z' => Some(c - b'A'),
            b'a'..=b'z' => Some(c - b'a' + 26),
            b'0'..=b'9' => Some(c - b'0' + 52),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }
    let bytes: Vec<u8> = s.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    let mut out = Vec::with_capacity(bytes.len() / 4 * 3);
    for chunk in bytes.chunks(4) {
        if chunk.len() < 2 {
            return Err(BeepError::Protocol("truncated base64 content".into()));
        }
        let c0 = val(chunk[0]).ok_or_else(|| BeepError::Protocol("invalid base64 byte".into()))?;
        let c1 = val(chunk[1]).ok_or_else(|| BeepError::Protocol("invalid base64 byte".into()))?;
        out.push((c0 << 2) | (c1 >> 4));
        if chunk.len() >= 3 && chunk[2] != b'=' {
            let c2 = val(chunk[2]).ok_or_else(|| BeepError::Protocol("invalid base64 byte".into()))?;
            out.push((c1 << 4) | (c2 >> 2));
            if chunk.len() >= 4 && chunk[3] != b'=' {
                let c3 = val(chunk[3])
                    .ok_or_else(|| BeepError::Protocol("invalid base64 byte".into()))?;
                out.push((c2 << 6) | c3);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_greeting() {
        let msg = ChannelZeroMsg::Greeting {
            profiles: vec![ProfileAd {
                uri: "http://iana.org/beep/TLS".into(),
                encoding: None,
                content: None,
            }],
            features: None,
            localize: None,
        };
        let encoded = msg.encode();
        let parsed = ChannelZeroMsg::parse(&encoded).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn parses_start_with_piggyback() {
        let wire = b"<start number='1'><profile uri='http://example.com/ECHO'>hello</profile></start>";
        let parsed = ChannelZeroMsg::parse(wire).unwrap();
        match parsed {
            ChannelZeroMsg::Start { number, profiles, .. } => {
                assert_eq!(number, 1);
                assert_eq!(profiles[0].uri, "http://example.com/ECHO");
                assert_eq!(profiles[0].content.as_deref(), Some(&b"hello"[..]));
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_standalone_profile_reply() {
        let wire = b"<profile uri='http://example.com/ECHO' encoding='base64'>aGVsbG8=</profile>";
        let parsed = ChannelZeroMsg::parse(wire).unwrap();
        match parsed {
            ChannelZeroMsg::Profile(ad) => {
                assert_eq!(ad.uri, "http://example.com/ECHO");
                assert_eq!(ad.content.as_deref(), Some(&b"hello"[..]));
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn profile_reply_round_trips() {
        let msg = ChannelZeroMsg::Profile(ProfileAd {
            uri: "http://example.com/ECHO".into(),
            encoding: None,
            content: None,
        });
        let encoded = msg.encode();
        assert_eq!(ChannelZeroMsg::parse(&encoded).unwrap(), msg);
    }

    #[test]
    fn base64_round_trip() {
        let data = b"the quick brown fox jumps";
        let encoded = base64_encode(data);
        let decoded = base64_decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn parses_close_and_error() {
        let close = ChannelZeroMsg::parse(b"<close number='3' code='200' />").unwrap();
        assert_eq!(close, ChannelZeroMsg::Close { number: 3, code: 200 });

        let err = ChannelZeroMsg::parse(b"<error code='550'>still working</error>").unwrap();
        assert_eq!(err, ChannelZeroMsg::Error { code: 550, message: "still working".into() });
    }

    #[test]
    fn parses_ok() {
        assert_eq!(ChannelZeroMsg::parse(b"<ok />").unwrap(), ChannelZeroMsg::Ok);
    }

    #[test]
    fn rejects_unknown_element() {
        assert!(ChannelZeroMsg::parse(b"<bogus />").is_err());
    }
}
