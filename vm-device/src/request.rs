// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

//! The I/O request exchanged between a trapping vCPU, the in-hypervisor
//! handlers and the external device model.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Highest valid port number.
pub const MAX_PIO_ADDRESS: u64 = 0xffff;

/// Kind of guest access carried by an [`IoRequest`].
///
/// The discriminants are the values used on the device model ABI.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum IoRequestKind {
    /// Port I/O (`in`/`out`).
    #[default]
    PortIo = 0,
    /// Memory-mapped I/O in the guest-physical address space.
    Mmio = 1,
}

impl TryFrom<u32> for IoRequestKind {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(IoRequestKind::PortIo),
            1 => Ok(IoRequestKind::Mmio),
            r => Err(r),
        }
    }
}

impl fmt::Display for IoRequestKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IoRequestKind::PortIo => write!(f, "PIO"),
            IoRequestKind::Mmio => write!(f, "MMIO"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum IoDirection {
    #[default]
    Read,
    Write,
}

/// Lifecycle of a request.
///
/// `Free -> Completed` when an internal handler resolves it synchronously,
/// `Free -> Pending -> Processing -> Completed` when it goes through the
/// device model, and back to `Free` once post-processing ran.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum RequestState {
    #[default]
    Free,
    /// Handed to the device model, not picked up yet.
    Pending,
    /// Claimed by the device model.
    Processing,
    Completed,
}

/// One trapped guest access.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct IoRequest {
    pub kind: IoRequestKind,
    pub address: u64,
    pub size: u8,
    pub direction: IoDirection,
    pub value: u64,
    pub state: RequestState,
}

/// Returns the mask covering the low `size` bytes.
pub fn size_mask(size: u8) -> u64 {
    match size {
        0 => 0,
        s if s >= 8 => u64::MAX,
        s => (1u64 << (u32::from(s) * 8)) - 1,
    }
}

impl IoRequest {
    pub fn pio_read(port: u16, size: u8) -> Self {
        IoRequest {
            kind: IoRequestKind::PortIo,
            address: u64::from(port),
            size,
            direction: IoDirection::Read,
            ..Default::default()
        }
    }

    pub fn pio_write(port: u16, size: u8, value: u64) -> Self {
        IoRequest {
            kind: IoRequestKind::PortIo,
            address: u64::from(port),
            size,
            direction: IoDirection::Write,
            value: value & size_mask(size),
            ..Default::default()
        }
    }

    pub fn mmio_read(gpa: u64, size: u8) -> Self {
        IoRequest {
            kind: IoRequestKind::Mmio,
            address: gpa,
            size,
            direction: IoDirection::Read,
            ..Default::default()
        }
    }

    pub fn mmio_write(gpa: u64, size: u8, value: u64) -> Self {
        IoRequest {
            kind: IoRequestKind::Mmio,
            address: gpa,
            size,
            direction: IoDirection::Write,
            value: value & size_mask(size),
            ..Default::default()
        }
    }

    pub fn is_read(&self) -> bool {
        self.direction == IoDirection::Read
    }

    /// Exclusive end of the accessed range, `None` on overflow.
    pub fn end(&self) -> Option<u64> {
        self.address.checked_add(u64::from(self.size))
    }

    /// Checks the shape of the access against what the hardware can trap.
    pub fn check_shape(&self) -> Result<(), &'static str> {
        let size_ok = match self.kind {
            IoRequestKind::PortIo => matches!(self.size, 1 | 2 | 4),
            IoRequestKind::Mmio => matches!(self.size, 1 | 2 | 4 | 8),
        };
        if !size_ok {
            return Err("unsupported access size");
        }
        if self.kind == IoRequestKind::PortIo && self.address > MAX_PIO_ADDRESS {
            return Err("port number out of range");
        }
        if self.end().is_none() {
            return Err("access wraps the address space");
        }
        Ok(())
    }

    /// Stores `value` truncated to the access width.
    pub fn set_value(&mut self, value: u64) {
        self.value = value & size_mask(self.size);
    }

    /// Back to an empty slot.
    pub fn reset(&mut self) {
        *self = IoRequest::default();
    }
}

impl fmt::Display for IoRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {:?} addr {:#x} size {} value {:#x} ({:?})",
            self.kind, self.direction, self.address, self.size, self.value, self.state
        )
    }
}
