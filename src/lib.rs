// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

#![doc = include_str!("../README.md")]

pub mod config;
pub mod fixed;
pub mod model;
pub mod sweep;

#[doc(inline)]
pub use vsweep_verilator as verilator;

pub mod prelude {
    pub use crate::{
        config::SweepConfig,
        model::{SignalBinding, SignalFormat, SweepModel, VerilatedSweepModel},
        sweep::{Sample, Sweep, SweepDriver},
    };
}
