// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

use std::sync::Mutex;

use vm_device::{HandlerError, HandlerResult, IoRequest, MmioHandler};

/// Byte-addressable register file mapped in guest-physical space.
///
/// Accesses of 1, 2, 4 or 8 bytes land at any offset, little endian.
/// Reads return whatever was last stored.
pub struct ScratchRegisters {
    base: u64,
    len: u64,
    data: Mutex<Vec<u8>>,
}

impl ScratchRegisters {
    pub fn new(base: u64, len: usize) -> Self {
        ScratchRegisters {
            base,
            len: len as u64,
            data: Mutex::new(vec![0u8; len]),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Exclusive end of the mapped window. A window wrapping the address
    /// space is reported empty, which registration refuses.
    pub fn end(&self) -> u64 {
        self.base.checked_add(self.len).unwrap_or(self.base)
    }
}

impl MmioHandler for ScratchRegisters {
    fn mmio_access(&self, req: &mut IoRequest) -> HandlerResult<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| HandlerError::Device("scratch register lock poisoned".to_string()))?;

        let size = usize::from(req.size);
        if size > 8 {
            return Err(HandlerError::InvalidAccessSize {
                address: req.address,
                size: req.size,
            });
        }

        let offset = req
            .address
            .checked_sub(self.base)
            .ok_or(HandlerError::InvalidRegister(req.address))? as usize;
        let window = data
            .get_mut(offset..offset.saturating_add(size))
            .ok_or(HandlerError::InvalidRegister(req.address))?;

        if req.is_read() {
            let mut bytes = [0u8; 8];
            bytes[..size].copy_from_slice(window);
            req.set_value(u64::from_le_bytes(bytes));
        } else {
            window.copy_from_slice(&req.value.to_le_bytes()[..size]);
        }

        debug!("Scratch register access: {}", req);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vm_device::MmioBus;

    #[test]
    fn test_scratch_store_load() {
        let dev = ScratchRegisters::new(0xd000_0000, 0x100);
        let mut req = IoRequest::mmio_write(0xd000_0010, 4, 0xdead_beef);
        dev.mmio_access(&mut req).unwrap();

        let mut req = IoRequest::mmio_read(0xd000_0010, 4);
        dev.mmio_access(&mut req).unwrap();
        assert_eq!(req.value, 0xdead_beef);

        // Narrower read of the same bytes.
        let mut req = IoRequest::mmio_read(0xd000_0012, 2);
        dev.mmio_access(&mut req).unwrap();
        assert_eq!(req.value, 0xdead);
    }

    #[test]
    fn test_scratch_bounds() {
        let dev = ScratchRegisters::new(0x1000, 0x10);
        assert_eq!(dev.end(), 0x1010);
        let mut req = IoRequest::mmio_read(0x100c, 8);
        assert!(matches!(
            dev.mmio_access(&mut req),
            Err(HandlerError::InvalidRegister(0x100c))
        ));
        let mut req = IoRequest::mmio_read(0xfff, 1);
        assert!(dev.mmio_access(&mut req).is_err());
    }

    #[test]
    fn test_scratch_wrapping_window() {
        let dev = Arc::new(ScratchRegisters::new(u64::MAX - 0xf, 0x100));
        assert_eq!(dev.end(), dev.base());

        let mut bus = MmioBus::new(1);
        let (start, end) = (dev.base(), dev.end());
        assert!(matches!(
            bus.insert(dev, start, end),
            Err(vm_device::Error::InvalidArgument(_))
        ));
        assert!(bus.is_empty());
    }
}
