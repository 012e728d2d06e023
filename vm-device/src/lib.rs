// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

//! Handler registries for trapped guest I/O.
//!
//! A VM owns one [`PioHandlerTable`] (fixed slots for well-known legacy
//! port groups), one [`MmioBus`] (ordered, non-overlapping guest-physical
//! ranges) and one [`PortBitmap`] (ports passed straight through to
//! hardware). The first two implement [`IoHandlerRegistry`] so the
//! dispatcher can treat them alike once it has split on the request kind.

#[macro_use]
extern crate log;

use thiserror::Error;

pub mod bitmap;
pub mod bus;
pub mod pio;
pub mod request;

pub use bitmap::PortBitmap;
pub use bus::{BusRange, MmioBus};
pub use pio::{PioHandlerTable, PioIndex, EMUL_PIO_IDX_MAX};
pub use request::{IoDirection, IoRequest, IoRequestKind, RequestState};

/// Failure reported by a device handler.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Invalid access size {size} at {address:#x}")]
    InvalidAccessSize { address: u64, size: u8 },

    #[error("No device register at {0:#x}")]
    InvalidRegister(u64),

    #[error("Device failure: {0}")]
    Device(String),
}

pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Emulated port I/O index {0} out of range")]
    InvalidPioIndex(u32),

    #[error("Handler failed: {0}")]
    Handler(#[source] HandlerError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Port I/O emulation callbacks.
///
/// The handler object carries its own private data. It may be called from
/// several vCPUs at once and serializes its state itself. A side left
/// unimplemented behaves like an absent callback: reads float high and
/// writes are dropped.
#[allow(unused_variables)]
pub trait PioHandler: Send + Sync {
    /// Reads `size` bytes from `port`.
    fn pio_read(&self, port: u16, size: u8) -> HandlerResult<u32> {
        Ok(u32::MAX)
    }

    /// Writes the low `size` bytes of `value` to `port`.
    fn pio_write(&self, port: u16, size: u8, value: u32) -> HandlerResult<()> {
        Ok(())
    }
}

/// Combined MMIO read/write callback.
///
/// On a read the handler fills `req.value`. The request is always fully
/// built and contained in the handler's registered range.
pub trait MmioHandler: Send + Sync {
    fn mmio_access(&self, req: &mut IoRequest) -> HandlerResult<()>;
}

/// What a registry found for an access.
pub enum Lookup<'a, H: ?Sized> {
    /// No entry intersects the access.
    Unclaimed,
    /// Exactly one entry, fully containing the access.
    Device(BusRange, &'a H),
    /// The access straddles an entry boundary or touches several entries.
    SpansMultipleDevices,
}

/// How a registry disposed of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Handled,
    Unclaimed,
    SpansMultipleDevices,
}

/// Common face of the PIO table and the MMIO list.
pub trait IoHandlerRegistry: Send + Sync {
    /// Looks up the handler for `req` and, if there is exactly one that
    /// covers the access, runs it synchronously.
    fn emulate(&self, req: &mut IoRequest) -> Result<Resolution>;
}
