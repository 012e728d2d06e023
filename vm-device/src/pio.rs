// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

//! Fixed table of emulated legacy port groups.
//!
//! Slots are indexed by what the ports mean, not by address, so
//! registration is a plain store. Two slots may be configured with
//! overlapping ranges; such an access is reported at lookup time.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    BusRange, Error, IoHandlerRegistry, IoRequest, IoRequestKind, Lookup, PioHandler, Resolution,
    Result,
};

/// Well-known port groups that get an emulation slot.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PioIndex {
    PicMaster = 0,
    PicSlave,
    PicElc,
    PciCfgAddr,
    PciCfgData,
    Uart,
    Pm1aEvt,
    Pm1aCnt,
    Pm1bEvt,
    Pm1bCnt,
    Rtc,
}

/// Number of emulated port I/O slots.
pub const EMUL_PIO_IDX_MAX: u32 = PioIndex::Rtc as u32 + 1;

impl PioIndex {
    pub const ALL: [PioIndex; EMUL_PIO_IDX_MAX as usize] = [
        PioIndex::PicMaster,
        PioIndex::PicSlave,
        PioIndex::PicElc,
        PioIndex::PciCfgAddr,
        PioIndex::PciCfgData,
        PioIndex::Uart,
        PioIndex::Pm1aEvt,
        PioIndex::Pm1aCnt,
        PioIndex::Pm1bEvt,
        PioIndex::Pm1bCnt,
        PioIndex::Rtc,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

impl TryFrom<u32> for PioIndex {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        PioIndex::ALL
            .get(raw as usize)
            .copied()
            .ok_or(Error::InvalidPioIndex(raw))
    }
}

impl fmt::Display for PioIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Clone)]
struct PioSlot {
    range: BusRange,
    handler: Arc<dyn PioHandler>,
}

/// Per-VM table of port I/O handlers.
#[derive(Clone)]
pub struct PioHandlerTable {
    slots: [Option<PioSlot>; EMUL_PIO_IDX_MAX as usize],
}

impl Default for PioHandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PioHandlerTable {
    pub fn new() -> Self {
        PioHandlerTable {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Binds `index` to `range`, replacing whatever the slot held.
    pub fn register(&mut self, index: PioIndex, range: BusRange, handler: Arc<dyn PioHandler>) {
        if self.slots[index.slot()].is_some() {
            debug!("Replacing port I/O handler {}", index);
        }
        debug!(
            "Port I/O handler {} registered for [{:#x}, {:#x})",
            index,
            range.base,
            range.end()
        );
        self.slots[index.slot()] = Some(PioSlot { range, handler });
    }

    /// Range currently bound to `index`.
    pub fn range(&self, index: PioIndex) -> Option<BusRange> {
        self.slots[index.slot()].as_ref().map(|s| s.range)
    }

    /// Finds the slots intersecting `[port, port + size)`.
    pub fn resolve(&self, port: u64, size: u64) -> Lookup<'_, dyn PioHandler> {
        let mut hits = self
            .slots
            .iter()
            .flatten()
            .filter(|s| s.range.overlaps(port, size));

        match (hits.next(), hits.next()) {
            (None, _) => Lookup::Unclaimed,
            (Some(slot), None) if slot.range.contains(port, size) => {
                Lookup::Device(slot.range, slot.handler.as_ref())
            }
            _ => Lookup::SpansMultipleDevices,
        }
    }
}

impl IoHandlerRegistry for PioHandlerTable {
    fn emulate(&self, req: &mut IoRequest) -> Result<Resolution> {
        debug_assert_eq!(req.kind, IoRequestKind::PortIo);

        let port = req.address as u16;
        match self.resolve(req.address, u64::from(req.size)) {
            Lookup::Unclaimed => Ok(Resolution::Unclaimed),
            Lookup::SpansMultipleDevices => {
                error!(
                    "Port I/O at {:#x} size {} crosses a handler boundary",
                    port, req.size
                );
                Ok(Resolution::SpansMultipleDevices)
            }
            Lookup::Device(_, handler) => {
                if req.is_read() {
                    let value = handler.pio_read(port, req.size).map_err(Error::Handler)?;
                    req.set_value(u64::from(value));
                    debug!("IO read on port {:#06x}, data {:#010x}", port, req.value);
                } else {
                    handler
                        .pio_write(port, req.size, req.value as u32)
                        .map_err(Error::Handler)?;
                    debug!("IO write on port {:#06x}, data {:#010x}", port, req.value);
                }
                Ok(Resolution::Handled)
            }
        }
    }
}
