// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

//! Architectural state needed to emulate guest I/O
//!
//! This crate holds the vCPU register model, the VMX exit information
//! for trapped I/O instructions and the decoder for instructions that
//! access emulated MMIO.
//!
//! # Platform support
//!
//! - x86_64
//!

#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;

/// Architecture specific definitions
pub mod arch;

/// CPU related module
mod cpu;

pub use arch::emulator::{EmulationError, EmulationResult, PlatformError};
pub use arch::x86::emulator::mmio::{MmioInstruction, MmioOperation};
pub use arch::x86::emulator::{CpuStateManager, EmulatorCpuState};
pub use arch::x86::vmx::IoExitQualification;
pub use arch::x86::{SegmentRegister, SpecialRegisters, StandardRegisters};
pub use cpu::VmExit;
pub use iced_x86::Register;
