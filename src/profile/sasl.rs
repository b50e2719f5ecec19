// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The SASL plug-in contract (§4.10): everything the core owns on
//! behalf of a SASL mechanism profile — starting a `SASL/<mech>`
//! channel, piggy-backing and exchanging `<blob>` elements on it, and
//! masking every SASL mechanism once one has completed. The actual
//! authentication math (a real `SCRAM`, `DIGEST-MD5`, `EXTERNAL`, …
//! exchange) is out of scope here: callers plug in a [`SaslMechanism`]
//! and this module drives it. Unlike [`crate::tuning`], a completed
//! SASL exchange does not reset the transport.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{debug, warn};

use crate::{
    channel::Channel,
    error::{BeepError, Result},
    greeting::xml::{base64_decode, base64_encode},
    profile::registry::{ProfileHandler, StartAccepted, StartOutcome, StartRefused, StartRequest},
};

/// What a completed SASL exchange leaves behind on the [`Connection`](
/// crate::connection::conn::Connection) that negotiated it, stashed via
/// [`crate::connection::conn::Connection::set_keyed`].
#[derive(Debug, Clone, Default)]
pub struct SaslAuthProperties {
    pub mechanism: String,
    pub authid: Option<String>,
    pub authzid: Option<String>,
    pub realm: Option<String>,
    /// Set when the mechanism authenticated as the anonymous identity
    /// (e.g. SASL ANONYMOUS), carrying the caller-supplied trace token.
    pub anonymous_token: Option<String>,
}

/// Marker stashed on the connection once any SASL mechanism completes,
/// so [`ProfileHandler::is_available`] can hide every `SASL/*` profile
/// from then on (§4.5, §4.10) rather than just the one that ran.
#[derive(Debug, Default)]
pub(crate) struct SaslCompleted(pub AtomicBool);

/// One step of driving a SASL mechanism forward.
pub enum SaslStep {
    /// Exchange continues; send this blob to the peer and wait for its
    /// reply.
    Continue(Vec<u8>),
    /// Exchange finished successfully.
    Complete(SaslAuthProperties),
    /// The peer's blob was rejected; abort with this human-readable
    /// reason.
    Abort(String),
}

/// The authentication logic for one mechanism. Implementations own
/// whatever cryptographic state a real mechanism needs between steps;
/// this crate ships no implementations, only the driver around this
/// trait.
pub trait SaslMechanism: Send + Sync {
    /// The IANA-registered mechanism name, e.g. `"PLAIN"`.
    fn name(&self) -> &str;

    /// The blob to piggy-back on a locally-initiated `<start>`, if the
    /// mechanism sends data first.
    fn initial_response(&self) -> Option<Vec<u8>> {
        None
    }

    /// Advances the exchange given the peer's latest blob (possibly
    /// empty, for a mechanism whose first real data comes from the
    /// responder).
    fn step(&self, challenge: &[u8]) -> SaslStep;
}

/// Wire status of one `<blob>` element exchanged on a SASL channel
/// (§4.10's informal grammar, mirroring the channel-0 XML dialect in
/// [`crate::greeting::xml`] but carried as ordinary `MSG`/`RPY` bodies
/// on a non-zero channel rather than on channel 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobStatus {
    Continue,
    Complete,
    Abort,
}

impl BlobStatus {
    fn as_str(self) -> &'static str {
        match self {
            BlobStatus::Continue => "continue",
            BlobStatus::Complete => "complete",
            BlobStatus::Abort => "abort",
        }
    }
}

/// One `<blob status=…>base64…</blob>` element.
#[derive(Debug, Clone)]
pub struct SaslBlob {
    pub status: BlobStatus,
    pub content: Vec<u8>,
}

impl SaslBlob {
    pub fn encode(&self) -> Vec<u8> {
        format!(
            "<blob status=\"{}\">{}</blob>",
            self.status.as_str(),
            base64_encode(&self.content)
        )
        .into_bytes()
    }

    pub fn parse(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body)
            .map_err(|_| BeepError::Protocol("SASL blob is not valid UTF-8".into()))?
            .trim();
        let status = if let Some(rest) = text.strip_prefix("<blob status=\"continue\">") {
            (BlobStatus::Continue, rest)
        } else if let Some(rest) = text.strip_prefix("<blob status=\"complete\">") {
            (BlobStatus::Complete, rest)
        } else if let Some(rest) = text.strip_prefix("<blob status=\"abort\">") {
            (BlobStatus::Abort, rest)
        } else {
            return Err(BeepError::Protocol(format!("unrecognized SASL blob element: {text:?}")));
        };
        let (status, rest) = status;
        let inner = rest
            .strip_suffix("</blob>")
            .ok_or_else(|| BeepError::Protocol("SASL blob missing closing tag".into()))?;
        let content = if inner.is_empty() { Vec::new() } else { base64_decode(inner)? };
        Ok(SaslBlob { status, content })
    }
}

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A [`ProfileHandler`] that drives an arbitrary [`SaslMechanism`] to
/// completion over `MSG`/`RPY` blobs on the channel it's started on,
/// then records a [`SaslAuthProperties`] on the connection and masks
/// every `SASL/*` profile (this one included) from further
/// advertisement.
pub struct SaslProfileHandler<M> {
    uri: String,
    mechanism: Arc<M>,
}

impl<M: SaslMechanism + 'static> SaslProfileHandler<M> {
    /// `uri` is normally `format!("SASL/{}", mechanism.name())`.
    pub fn new(uri: impl Into<String>, mechanism: M) -> Self {
        Self { uri: uri.into(), mechanism: Arc::new(mechanism) }
    }
}

impl<M: SaslMechanism + 'static> ProfileHandler for SaslProfileHandler<M> {
    /// Runs the mechanism's first step against the peer's piggy-backed
    /// initial response, if any, and piggy-backs our own first blob
    /// back in the `<profile>` reply (§4.10). A mechanism that
    /// completes or aborts on this very first step is refused here,
    /// before a channel is ever created, rather than being driven
    /// further in [`Self::on_started`].
    fn on_start<'a>(&'a self, req: &'a StartRequest) -> BoxFut<'a, StartOutcome> {
        let mechanism = self.mechanism.clone();
        Box::pin(async move {
            let initial = req.piggyback.clone().unwrap_or_default();
            match mechanism.step(&initial) {
                SaslStep::Continue(blob) => {
                    let reply = SaslBlob { status: BlobStatus::Continue, content: blob };
                    Ok(StartAccepted { piggyback: Some(reply.encode()) })
                },
                SaslStep::Complete(props) => {
                    if req.connection.with_keyed::<SaslCompleted, _>(|_| ()).is_none() {
                        req.connection.set_keyed(SaslCompleted::default());
                    }
                    req.connection
                        .with_keyed::<SaslCompleted, _>(|c| c.0.store(true, Ordering::SeqCst));
                    req.connection.set_keyed(props);
                    Ok(StartAccepted::default())
                },
                SaslStep::Abort(reason) => Err(StartRefused { code: 535, message: reason }),
            }
        })
    }

    fn on_started<'a>(&'a self, channel: Arc<Channel>) -> BoxFut<'a, ()> {
        let mechanism = self.mechanism.clone();
        Box::pin(async move {
            let Some(conn) = channel.connection() else { return };
            // Lazily seed the shared "any SASL mechanism completed"
            // flag. A second mechanism racing this on another channel
            // would momentarily reset it, but only one `SASL/*` start
            // is ever in flight at a time per §4.10's masking rule.
            if conn.with_keyed::<SaslCompleted, _>(|_| ()).is_none() {
                conn.set_keyed(SaslCompleted::default());
            }
            let Some(mut inbound) = channel.take_inbound().await else {
                return;
            };
            tokio::spawn(async move {
                while let Some(msg) = inbound.recv().await {
                    let blob = match SaslBlob::parse(&msg.payload) {
                        Ok(b) => b,
                        Err(e) => {
                            warn!(error = %e, "malformed SASL blob, aborting exchange");
                            let _ = channel.reply_err(msg.msgno, 500, "malformed SASL blob").await;
                            break;
                        },
                    };
                    if blob.status == BlobStatus::Abort {
                        debug!(mechanism = mechanism.name(), "peer aborted SASL exchange");
                        break;
                    }
                    match mechanism.step(&blob.content) {
                        SaslStep::Continue(next) => {
                            let reply = SaslBlob { status: BlobStatus::Continue, content: next };
                            if channel.reply_rpy(msg.msgno, None, &reply.encode()).await.is_err() {
                                break;
                            }
                        },
                        SaslStep::Complete(props) => {
                            let reply = SaslBlob { status: BlobStatus::Complete, content: Vec::new() };
                            let _ = channel.reply_rpy(msg.msgno, None, &reply.encode()).await;
                            conn.with_keyed::<SaslCompleted, _>(|c| c.0.store(true, Ordering::SeqCst));
                            conn.set_keyed(props);
                            break;
                        },
                        SaslStep::Abort(reason) => {
                            warn!(
                                mechanism = mechanism.name(),
                                reason = %reason,
                                "local side aborting SASL exchange"
                            );
                            let _ = channel.reply_err(msg.msgno, 535, &reason).await;
                            break;
                        },
                    }
                }
            });
        })
    }

    fn is_available(&self, conn: &crate::connection::conn::Connection) -> bool {
        !conn
            .with_keyed::<SaslCompleted, _>(|c| c.0.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

impl<M> SaslProfileHandler<M> {
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trips_through_encode_and_parse() {
        let blob = SaslBlob { status: BlobStatus::Continue, content: b"hello".to_vec() };
        let wire = blob.encode();
        let parsed = SaslBlob::parse(&wire).unwrap();
        assert_eq!(parsed.status, BlobStatus::Continue);
        assert_eq!(parsed.content, b"hello");
    }

    #[test]
    fn empty_blob_round_trips() {
        let blob = SaslBlob { status: BlobStatus::Complete, content: Vec::new() };
        let parsed = SaslBlob::parse(&blob.encode()).unwrap();
        assert!(parsed.content.is_empty());
    }

    #[test]
    fn rejects_unknown_status() {
        assert!(SaslBlob::parse(b"<blob status=\"bogus\">AA==</blob>").is_err());
    }

    struct AnonymousMechanism;
    impl SaslMechanism for AnonymousMechanism {
        fn name(&self) -> &str {
            "ANONYMOUS"
        }

        fn step(&self, challenge: &[u8]) -> SaslStep {
            let token = String::from_utf8_lossy(challenge).into_owned();
            SaslStep::Complete(SaslAuthProperties {
                mechanism: self.name().to_string(),
                anonymous_token: Some(token),
                ..Default::default()
            })
        }
    }

    #[test]
    fn anonymous_mechanism_completes_on_first_step() {
        let mech = AnonymousMechanism;
        match mech.step(b"trace@example.com") {
            SaslStep::Complete(props) => {
                assert_eq!(props.mechanism, "ANONYMOUS");
                assert_eq!(props.anonymous_token.as_deref(), Some("trace@example.com"));
            },
            _ => panic!("expected immediate completion"),
        }
    }
}
