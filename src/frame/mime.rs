// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Splits a frame payload into its optional MIME header block and
//! body, per RFC 3080 §2.2.

use std::collections::HashMap;

use bytes::Bytes;

/// The `Content-Type` / `Content-Transfer-Encoding` pair BEEP
/// recognizes on a per-message basis, plus any other headers a
/// profile cares to stash alongside them.
#[derive(Debug, Clone, Default)]
pub struct MimeHeaders {
    pub content_type: Option<String>,
    pub content_transfer_encoding: Option<String>,
    pub other: HashMap<String, String>,
}

/// Splits `payload` at the first blank line (`\r\n\r\n`). Absent a
/// blank line the entire payload is treated as the body with no MIME
/// headers — this never fails the frame, matching the permissive
/// posture RFC 3080 takes for messages that omit MIME entirely.
pub fn split_mime(payload: &Bytes) -> (MimeHeaders, Bytes) {
    let Some(pos) = find_blank_line(payload) else {
        return (MimeHeaders::default(), payload.clone());
    };

    let header_block = &payload[..pos];
    let body = payload.slice(pos + 4..);

    let mut headers = MimeHeaders::default();
    let Ok(text) = std::str::from_utf8(header_block) else {
        return (MimeHeaders::default(), payload.clone());
    };
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim().to_string();
        match name.to_ascii_lowercase().as_str() {
            "content-type" => headers.content_type = Some(value),
            "content-transfer-encoding" => headers.content_transfer_encoding = Some(value),
            _ => {
                headers.other.insert(name.to_string(), value);
            },
        }
    }

    (headers, body)
}

fn find_blank_line(payload: &[u8]) -> Option<usize> {
    payload.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_mime_header_yields_whole_payload_as_body() {
        let payload = Bytes::from_static(b"just a body, no mime");
        let (headers, body) = split_mime(&payload);
        assert!(headers.content_type.is_none());
        assert_eq!(&body[..], &payload[..]);
    }

    #[test]
    fn splits_content_type_and_body() {
        let payload =
            Bytes::from_static(b"Content-Type: application/beep+xml\r\n\r\n<start/>");
        let (headers, body) = split_mime(&payload);
        assert_eq!(headers.content_type.as_deref(), Some("application/beep+xml"));
        assert_eq!(&body[..], b"<start/>");
    }
}
