// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The tuning reset manager (C11): restarts a connection's transport
//! in place for TLS/SASL profiles, per §4.8.

pub mod reset;

pub use reset::{TuningBackend, TuningProfileHandler, client_tuning_reset, run_tuning_reset};
