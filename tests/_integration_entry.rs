// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

#![allow(clippy::all)]

mod integration_tests {
    pub mod common;

    pub mod basic_roundtrip;
    pub mod close_in_transit;
    pub mod flow_control;
    pub mod reference_safety;
    pub mod serialize_reorder;
    pub mod tuning_refusal;
}
