// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{BeepError, Result};

/// Races `fut` against `io_timeout` and `cancel`, turning whichever
/// fires first into a typed error. Every blocking wait in the runtime
/// (socket reads/writes, reply waits, tuning handshakes) goes through
/// this so a single cancellation token can unstick all of them at
/// once.
pub async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(BeepError::TimeoutError(format!("{label} cancelled"))),
        res = timeout(io_timeout, fut) => {
            match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(BeepError::TimeoutError(label.to_string())),
            }
        }
    }
}
