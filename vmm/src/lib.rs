// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Trapped guest I/O emulation for a VM.
//!
//! A [`vm::Vm`] owns the handler tables, the passthrough bitmap and the
//! channel to the external device model. Each [`cpu::Vcpu`] turns its VM
//! exits into I/O requests, routes them through [`io_emul`] and writes the
//! results back into its registers.

#[macro_use]
extern crate log;

pub mod config;
pub mod cpu;
pub mod io_emul;
pub mod ioreq;
pub mod vm;

pub use crate::config::{LoadOrder, VmConfig};
pub use crate::cpu::Vcpu;
pub use crate::io_emul::{
    dispatch_io_request, emulate_io_post, emulate_mmio_post, emulate_pio_post, IoOutcome,
};
pub use crate::ioreq::{DeviceModel, IoReqChannel, IoReqClient};
pub use crate::vm::{Vm, VmState};
