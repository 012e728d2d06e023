// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.

//! Handles routing of guest-physical MMIO accesses to emulation handlers.

use std::cmp::{Ord, Ordering, PartialEq, PartialOrd};
use std::collections::btree_map::BTreeMap;
use std::sync::Arc;

use crate::{
    Error, IoHandlerRegistry, IoRequest, IoRequestKind, Lookup, MmioHandler, Resolution, Result,
};

/// Holds a base and length representing an address range claimed by a handler.
///
/// * base - The address at which the range start.
/// * len - The length of the range in bytes.
#[derive(Debug, Copy, Clone)]
pub struct BusRange {
    pub base: u64,
    pub len: u64,
}

impl BusRange {
    /// Builds the range `[start, end)`.
    pub fn from_bounds(start: u64, end: u64) -> Option<BusRange> {
        if end > start {
            Some(BusRange {
                base: start,
                len: end - start,
            })
        } else {
            None
        }
    }

    /// Exclusive end, saturated at the top of the address space.
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.len)
    }

    /// Returns true if there is overlap with the given range.
    pub fn overlaps(&self, base: u64, len: u64) -> bool {
        len != 0 && self.len != 0 && self.base < base.saturating_add(len) && base < self.end()
    }

    /// Returns true if the given range lies entirely inside this one.
    pub fn contains(&self, base: u64, len: u64) -> bool {
        base >= self.base && base.saturating_add(len) <= self.end()
    }
}

impl Eq for BusRange {}

impl PartialEq for BusRange {
    fn eq(&self, other: &BusRange) -> bool {
        self.base == other.base
    }
}

impl Ord for BusRange {
    fn cmp(&self, other: &BusRange) -> Ordering {
        self.base.cmp(&other.base)
    }
}

impl PartialOrd for BusRange {
    fn partial_cmp(&self, other: &BusRange) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered list of emulated MMIO ranges.
///
/// Ranges never overlap and are only inserted while the owning VM is
/// being configured; lookups are a single ordered search.
#[derive(Clone)]
pub struct MmioBus {
    handlers: BTreeMap<BusRange, Arc<dyn MmioHandler>>,
    max_regions: usize,
}

impl MmioBus {
    /// Constructs an empty list accepting at most `max_regions` entries.
    pub fn new(max_regions: usize) -> MmioBus {
        MmioBus {
            handlers: BTreeMap::new(),
            max_regions,
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Claims `[start, end)` for `handler`.
    pub fn insert(&mut self, handler: Arc<dyn MmioHandler>, start: u64, end: u64) -> Result<()> {
        let range = BusRange::from_bounds(start, end)
            .ok_or(Error::InvalidArgument("MMIO range end must be above its start"))?;

        if self.handlers.len() >= self.max_regions {
            error!(
                "No room for MMIO range [{:#x}, {:#x}): {} regions in use",
                start,
                end,
                self.handlers.len()
            );
            return Err(Error::InvalidArgument("emulated MMIO regions exhausted"));
        }

        // Reject all cases where the new range overlaps with an existing one.
        if self
            .handlers
            .keys()
            .any(|r| r.overlaps(range.base, range.len))
        {
            return Err(Error::InvalidArgument("MMIO range overlaps a registered range"));
        }

        debug!("MMIO handler registered for [{:#x}, {:#x})", start, end);
        self.handlers.insert(range, handler);
        Ok(())
    }

    /// Returns the entry with the highest base below `end`.
    fn last_before(&self, end: u64) -> Option<(BusRange, &Arc<dyn MmioHandler>)> {
        let (range, handler) = self
            .handlers
            .range(..BusRange { base: end, len: 1 })
            .next_back()?;
        Some((*range, handler))
    }

    /// Finds the handlers intersecting `[addr, addr + size)`.
    pub fn resolve(&self, addr: u64, size: u64) -> Lookup<'_, dyn MmioHandler> {
        let end = match addr.checked_add(size) {
            Some(end) if size != 0 => end,
            _ => return Lookup::SpansMultipleDevices,
        };

        // Ranges are disjoint and sorted, so only the last one starting
        // below `end` can intersect without another one intersecting too.
        match self.last_before(end) {
            Some((range, _)) if range.end() <= addr => Lookup::Unclaimed,
            Some((range, handler)) if range.contains(addr, size) => {
                Lookup::Device(range, handler.as_ref())
            }
            Some(_) => Lookup::SpansMultipleDevices,
            None => Lookup::Unclaimed,
        }
    }
}

impl IoHandlerRegistry for MmioBus {
    fn emulate(&self, req: &mut IoRequest) -> Result<Resolution> {
        debug_assert_eq!(req.kind, IoRequestKind::Mmio);

        match self.resolve(req.address, u64::from(req.size)) {
            Lookup::Unclaimed => Ok(Resolution::Unclaimed),
            Lookup::SpansMultipleDevices => {
                error!(
                    "MMIO access at {:#x} size {} crosses a handler boundary",
                    req.address, req.size
                );
                Ok(Resolution::SpansMultipleDevices)
            }
            Lookup::Device(range, handler) => {
                handler.mmio_access(req).map_err(Error::Handler)?;
                if req.is_read() {
                    let v = req.value;
                    req.set_value(v);
                }
                debug!(
                    "MMIO {:?} in [{:#x}, {:#x}): {}",
                    req.direction,
                    range.base,
                    range.end(),
                    req
                );
                Ok(Resolution::Handled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HandlerError, HandlerResult};
    use std::sync::Mutex;

    struct DummyHandler;
    impl MmioHandler for DummyHandler {
        fn mmio_access(&self, _req: &mut IoRequest) -> HandlerResult<()> {
            Ok(())
        }
    }

    struct ConstantHandler;
    impl MmioHandler for ConstantHandler {
        fn mmio_access(&self, req: &mut IoRequest) -> HandlerResult<()> {
            if req.is_read() {
                req.value = 0xdead_beef_cafe_f00d;
            }
            Ok(())
        }
    }

    struct FailingHandler;
    impl MmioHandler for FailingHandler {
        fn mmio_access(&self, req: &mut IoRequest) -> HandlerResult<()> {
            Err(HandlerError::InvalidRegister(req.address))
        }
    }

    #[derive(Default)]
    struct LastWrite(Mutex<Option<u64>>);
    impl MmioHandler for LastWrite {
        fn mmio_access(&self, req: &mut IoRequest) -> HandlerResult<()> {
            if !req.is_read() {
                *self.0.lock().unwrap() = Some(req.value);
            }
            Ok(())
        }
    }

    #[test]
    fn bus_insert() {
        let mut bus = MmioBus::new(8);
        let dummy: Arc<dyn MmioHandler> = Arc::new(DummyHandler);
        assert!(bus.insert(dummy.clone(), 0x10, 0x10).is_err());
        assert!(bus.insert(dummy.clone(), 0x10, 0x8).is_err());
        assert!(bus.insert(dummy.clone(), 0x10, 0x20).is_ok());

        assert!(bus.insert(dummy.clone(), 0x0f, 0x1f).is_err());
        assert!(bus.insert(dummy.clone(), 0x10, 0x20).is_err());
        assert!(bus.insert(dummy.clone(), 0x12, 0x13).is_err());
        assert!(bus.insert(dummy.clone(), 0x0, 0x30).is_err());
        assert!(bus.insert(dummy.clone(), 0x20, 0x25).is_ok());
        assert!(bus.insert(dummy.clone(), 0x25, 0x2a).is_ok());
        assert!(bus.insert(dummy, 0x0, 0x10).is_ok());
        assert_eq!(bus.len(), 4);
    }

    #[test]
    fn bus_capacity() {
        let mut bus = MmioBus::new(1);
        let dummy: Arc<dyn MmioHandler> = Arc::new(DummyHandler);
        assert!(bus.insert(dummy.clone(), 0x1000, 0x2000).is_ok());
        assert!(matches!(
            bus.insert(dummy, 0x3000, 0x4000),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn bus_resolve() {
        let mut bus = MmioBus::new(8);
        bus.insert(Arc::new(DummyHandler), 10000, 10010).unwrap();
        bus.insert(Arc::new(DummyHandler), 10010, 10020).unwrap();

        assert!(matches!(bus.resolve(10004, 4), Lookup::Device(r, _) if r.base == 10000));
        assert!(matches!(bus.resolve(10012, 8), Lookup::Device(r, _) if r.base == 10010));
        // Straddles both ranges.
        assert!(matches!(bus.resolve(10008, 4), Lookup::SpansMultipleDevices));
        // Runs off the end of the last range.
        assert!(matches!(bus.resolve(10016, 8), Lookup::SpansMultipleDevices));
        // Starts below the first range.
        assert!(matches!(bus.resolve(9998, 4), Lookup::SpansMultipleDevices));
        assert!(matches!(bus.resolve(9990, 8), Lookup::Unclaimed));
        assert!(matches!(bus.resolve(10020, 8), Lookup::Unclaimed));
        assert!(matches!(bus.resolve(u64::MAX, 8), Lookup::SpansMultipleDevices));
    }

    #[test]
    fn bus_spans_single_range_end() {
        let mut bus = MmioBus::new(8);
        bus.insert(Arc::new(DummyHandler), 10000, 10010).unwrap();

        let mut req = IoRequest::mmio_read(10008, 4);
        assert_eq!(bus.emulate(&mut req).unwrap(), Resolution::SpansMultipleDevices);
        let mut req = IoRequest::mmio_read(10004, 4);
        assert_eq!(bus.emulate(&mut req).unwrap(), Resolution::Handled);
    }

    #[test]
    fn bus_emulate_values() {
        let mut bus = MmioBus::new(8);
        let store = Arc::new(LastWrite::default());
        bus.insert(Arc::new(ConstantHandler), 0x1000, 0x1100).unwrap();
        bus.insert(store.clone(), 0x2000, 0x2100).unwrap();

        let mut req = IoRequest::mmio_read(0x1010, 2);
        assert_eq!(bus.emulate(&mut req).unwrap(), Resolution::Handled);
        assert_eq!(req.value, 0xf00d);

        let mut req = IoRequest::mmio_write(0x2008, 8, 0x1122_3344_5566_7788);
        assert_eq!(bus.emulate(&mut req).unwrap(), Resolution::Handled);
        assert_eq!(*store.0.lock().unwrap(), Some(0x1122_3344_5566_7788));

        let mut req = IoRequest::mmio_read(0x3000, 4);
        assert_eq!(bus.emulate(&mut req).unwrap(), Resolution::Unclaimed);
    }

    #[test]
    fn bus_handler_failure() {
        let mut bus = MmioBus::new(8);
        bus.insert(Arc::new(FailingHandler), 0x1000, 0x1100).unwrap();
        let mut req = IoRequest::mmio_read(0x1000, 4);
        assert!(matches!(
            bus.emulate(&mut req),
            Err(Error::Handler(HandlerError::InvalidRegister(0x1000)))
        ));
    }

    #[test]
    fn busrange_cmp() {
        let range = BusRange { base: 0x10, len: 2 };
        assert_eq!(range, BusRange { base: 0x10, len: 3 });
        assert!(range < BusRange { base: 0x12, len: 1 });
        assert!(BusRange::from_bounds(0x20, 0x20).is_none());
        assert_eq!(BusRange::from_bounds(0x20, 0x30).unwrap().len, 0x10);
    }

    #[test]
    fn bus_range_overlap() {
        let a = BusRange {
            base: 0x1000,
            len: 0x400,
        };
        assert!(a.overlaps(0x1000, 0x400));
        assert!(a.overlaps(0xf00, 0x400));
        assert!(a.overlaps(0x1000, 0x01));
        assert!(a.overlaps(0xfff, 0x02));
        assert!(a.overlaps(0x1100, 0x100));
        assert!(a.overlaps(0x13ff, 0x100));
        assert!(!a.overlaps(0x1400, 0x100));
        assert!(!a.overlaps(0xf00, 0x100));
        assert!(!a.overlaps(0x1000, 0));
        assert!(a.contains(0x13fc, 4));
        assert!(!a.contains(0x13fe, 4));
    }
}
