// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! VMX exit information for I/O instructions.
//!
//! SDM Vol 3, Table 27-5: Exit Qualification for I/O Instructions.

const IO_SIZE_MASK: u64 = 0x7;
const IO_DIRECTION_IN: u64 = 1 << 3;
const IO_STRING: u64 = 1 << 4;
const IO_REP: u64 = 1 << 5;
const IO_OPERAND_IMMEDIATE: u64 = 1 << 6;
const IO_PORT_SHIFT: u64 = 16;
const IO_PORT_MASK: u64 = 0xffff;

/// Exit qualification of an I/O instruction VM exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoExitQualification(pub u64);

impl IoExitQualification {
    /// Encodes the qualification the hardware reports for a non-string
    /// `in`/`out` with the port in DX.
    pub fn new(port: u16, size: u8, is_in: bool) -> Self {
        let mut raw = (u64::from(size.saturating_sub(1)) & IO_SIZE_MASK)
            | (u64::from(port) << IO_PORT_SHIFT);
        if is_in {
            raw |= IO_DIRECTION_IN;
        }
        IoExitQualification(raw)
    }

    /// Access width in bytes (1, 2 or 4 for valid encodings).
    pub fn size(&self) -> u8 {
        (self.0 & IO_SIZE_MASK) as u8 + 1
    }

    pub fn is_in(&self) -> bool {
        self.0 & IO_DIRECTION_IN != 0
    }

    pub fn is_string(&self) -> bool {
        self.0 & IO_STRING != 0
    }

    pub fn is_rep(&self) -> bool {
        self.0 & IO_REP != 0
    }

    pub fn is_immediate(&self) -> bool {
        self.0 & IO_OPERAND_IMMEDIATE != 0
    }

    pub fn port(&self) -> u16 {
        ((self.0 >> IO_PORT_SHIFT) & IO_PORT_MASK) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_in() {
        // in al, 0x71
        let qual = IoExitQualification(0x0071_0048);
        assert_eq!(qual.port(), 0x71);
        assert_eq!(qual.size(), 1);
        assert!(qual.is_in());
        assert!(qual.is_immediate());
        assert!(!qual.is_string());
        assert!(!qual.is_rep());
    }

    #[test]
    fn test_decode_rep_outs() {
        // rep outsw
        let qual = IoExitQualification(0x03f8_0031);
        assert_eq!(qual.port(), 0x3f8);
        assert_eq!(qual.size(), 2);
        assert!(!qual.is_in());
        assert!(qual.is_string());
        assert!(qual.is_rep());
    }

    #[test]
    fn test_encode() {
        let qual = IoExitQualification::new(0xcfc, 4, false);
        assert_eq!(qual.0, 0x0cfc_0003);
        assert_eq!(qual.size(), 4);
        assert!(!qual.is_in());

        let qual = IoExitQualification::new(0x70, 1, true);
        assert_eq!(qual.port(), 0x70);
        assert!(qual.is_in());
    }
}
