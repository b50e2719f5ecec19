// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{pin::Pin, sync::Arc};

use beep_rs::{
    cfg::{config::Config, enums::ConnRole},
    channel::ExchangeReply,
    context::Context,
    error::Result,
    io::BoxedConnIo,
    listener::Listener,
    profile::{
        echo::{ECHO_PROFILE_URI, EchoProfile},
        registry::{ProfileHandler, StartOutcome, StartRefused, StartRequest},
    },
    session::Session,
    tuning::TuningBackend,
};

use crate::integration_tests::common;

const TLS_PROFILE_URI: &str = "http://iana.org/beep/TLS";

type BoxFut<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Refuses every `<start>` for the TLS profile with a `421` — a peer
/// that doesn't support (or, here, simply won't grant) the tuning
/// profile the client asked for.
struct RefuseTls;

impl ProfileHandler for RefuseTls {
    fn on_start<'a>(&'a self, _req: &'a StartRequest) -> BoxFut<'a, StartOutcome> {
        Box::pin(async {
            Err(StartRefused { code: 421, message: "service not available, TLS refused".into() })
        })
    }
}

/// A [`TuningBackend`] whose handshake must never run, because the
/// `<start>` that would trigger it is always refused first.
struct UnreachableTlsBackend;

impl TuningBackend for UnreachableTlsBackend {
    fn profile_uri(&self) -> &str {
        TLS_PROFILE_URI
    }

    fn handshake<'a>(&'a self, _io: BoxedConnIo, _role: ConnRole) -> BoxFut<'a, Result<BoxedConnIo>> {
        Box::pin(async { panic!("TLS handshake must not run after a refused <start>") })
    }
}

/// S4: client configures `auto_tls`, the peer refuses the TLS
/// `<start>`. The connection must remain usable as plain BEEP and its
/// TLS-activated flag must stay false.
#[tokio::test]
async fn refused_auto_tls_leaves_connection_usable_in_plain_text() {
    let listener_ctx = Context::new(Config::default());
    listener_ctx.register_profile(ECHO_PROFILE_URI, Arc::new(EchoProfile));
    listener_ctx.register_profile(TLS_PROFILE_URI, Arc::new(RefuseTls));
    let listener = Arc::new(Listener::new(listener_ctx));
    let addr = listener
        .bind_and_spawn("127.0.0.1:0")
        .await
        .expect("listener bind failed");

    let mut client_cfg = Config::default();
    client_cfg.tuning.auto_tls = true;
    let client_ctx = Context::new(client_cfg);
    client_ctx.register_tuning_backend(Arc::new(UnreachableTlsBackend));

    let session = Session::connect(client_ctx, &addr.to_string())
        .await
        .expect("client connect failed despite a refused auto_tls attempt");

    assert!(!session.connection().is_tls_activated());

    let channel = session
        .start_channel(ECHO_PROFILE_URI, None, None)
        .await
        .expect("start_channel failed after refused auto_tls");
    let reply = session
        .send_and_wait(&channel, None, b"still plain text")
        .await
        .expect("send_and_wait failed");
    match reply {
        ExchangeReply::Rpy { payload, .. } => assert_eq!(&payload[..], b"still plain text"),
        ExchangeReply::Err { code, message } => panic!("peer refused ({code}): {message}"),
    }

    session
        .close_channel(channel.number, 200)
        .await
        .expect("close_channel failed");
    session.close(common::STEP_TIMEOUT).await.expect("session close failed");
}
