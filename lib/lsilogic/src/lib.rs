// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![allow(clippy::style)]

#[macro_use]
extern crate bitflags;

pub mod common;
pub mod hw;
pub mod intr_pins;
pub mod lifecycle;
pub mod migrate;
pub mod scsi;
pub mod util;
pub mod vmm;

pub use hw::lsilogic::{Config, ControllerType, LsiError, PciLsiLogic};
