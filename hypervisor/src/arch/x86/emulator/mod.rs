//
// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

extern crate iced_x86;

use crate::arch::emulator::PlatformError;
use crate::arch::x86::regs::{CR0_PE, CR0_PG, EFER_LMA, EFER_LME};
use crate::arch::x86::{SegmentRegister, SpecialRegisters, StandardRegisters};
use iced_x86::*;

pub mod mmio;

/// CpuStateManager manages an x86 CPU state.
///
/// Post-processing of emulated I/O gets a mutable reference to a
/// `CpuStateManager` implementation and updates the trapping vCPU's
/// registers through it.
pub trait CpuStateManager: Clone {
    /// Reads a CPU register.
    ///
    /// # Arguments
    ///
    /// * `reg` - A general purpose or control register.
    fn read_reg(&self, reg: Register) -> Result<u64, PlatformError>;

    /// Write to a CPU register.
    ///
    /// # Arguments
    ///
    /// * `reg` - A general purpose or control register.
    /// * `val` - The value to load.
    fn write_reg(&mut self, reg: Register, val: u64) -> Result<(), PlatformError>;

    /// Reads a segment register.
    ///
    /// # Arguments
    ///
    /// * `reg` - A segment register.
    fn read_segment(&self, reg: Register) -> Result<SegmentRegister, PlatformError>;

    /// Get the CPU instruction pointer.
    fn ip(&self) -> u64;

    /// Set the CPU instruction pointer.
    ///
    /// # Arguments
    ///
    /// * `ip` - The CPU instruction pointer.
    fn set_ip(&mut self, ip: u64);

    /// Get the CPU Extended Feature Enable Register.
    fn efer(&self) -> u64;

    /// Decoder bitness for the current code segment.
    fn bitness(&self) -> Result<u32, PlatformError> {
        let cr0 = self.read_reg(Register::CR0)?;
        if cr0 & CR0_PE == 0 {
            return Ok(16);
        }

        let cs = self.read_segment(Register::CS)?;
        if self.efer() & EFER_LMA != 0 && cs.l == 1 {
            if cs.db == 1 {
                return Err(PlatformError::UnsupportedCpuMode(anyhow!(
                    "CS.L and CS.D both set"
                )));
            }
            Ok(64)
        } else if cs.db == 1 {
            Ok(32)
        } else {
            Ok(16)
        }
    }
}

const REGISTER_MASK_64: u64 = 0xffff_ffff_ffff_ffffu64;
const REGISTER_MASK_32: u64 = 0xffff_ffffu64;
const REGISTER_MASK_16: u64 = 0xffffu64;
const REGISTER_MASK_8: u64 = 0xffu64;

/// Mask of the low `size` bytes of a register.
pub fn operand_mask(size: usize) -> u64 {
    match size {
        1 => REGISTER_MASK_8,
        2 => REGISTER_MASK_16,
        4 => REGISTER_MASK_32,
        _ => REGISTER_MASK_64,
    }
}

/// Accumulator register of the given width, the target of `in`.
pub fn accumulator(size: u8) -> Option<Register> {
    match size {
        1 => Some(Register::AL),
        2 => Some(Register::AX),
        4 => Some(Register::EAX),
        8 => Some(Register::RAX),
        _ => None,
    }
}

fn is_high_byte(reg: Register) -> bool {
    matches!(
        reg,
        Register::AH | Register::BH | Register::CH | Register::DH
    )
}

macro_rules! set_reg {
    ($reg:expr, $mask:expr, $value:expr) => {
        $reg = ($reg & $mask) | $value
    };
}

#[derive(Clone, Default, Debug)]
/// A minimal, emulated CPU state.
///
/// This is the register file a vCPU keeps between VM exits, and the one
/// I/O post-processing writes results into.
pub struct EmulatorCpuState {
    pub regs: StandardRegisters,
    pub sregs: SpecialRegisters,
}

impl EmulatorCpuState {
    /// 64-bit long mode with a flat code segment.
    pub fn long_mode() -> Self {
        let mut state = EmulatorCpuState::default();
        state.sregs.cr0 = CR0_PE | CR0_PG;
        state.sregs.efer = EFER_LME | EFER_LMA;
        state.sregs.cs = SegmentRegister {
            selector: 0x10,
            type_: 0xb,
            present: 1,
            s: 1,
            l: 1,
            g: 1,
            limit: 0xffff_ffff,
            ..Default::default()
        };
        state
    }

    fn gpr_value(&self, full: Register) -> Option<u64> {
        let r = &self.regs;
        Some(match full {
            Register::RAX => r.rax,
            Register::RBX => r.rbx,
            Register::RCX => r.rcx,
            Register::RDX => r.rdx,
            Register::RSP => r.rsp,
            Register::RBP => r.rbp,
            Register::RSI => r.rsi,
            Register::RDI => r.rdi,
            Register::R8 => r.r8,
            Register::R9 => r.r9,
            Register::R10 => r.r10,
            Register::R11 => r.r11,
            Register::R12 => r.r12,
            Register::R13 => r.r13,
            Register::R14 => r.r14,
            Register::R15 => r.r15,
            Register::CR0 => self.sregs.cr0,
            Register::CR3 => self.sregs.cr3,
            Register::CR4 => self.sregs.cr4,
            _ => return None,
        })
    }

    fn gpr(&mut self, full: Register) -> Option<&mut u64> {
        let r = &mut self.regs;
        Some(match full {
            Register::RAX => &mut r.rax,
            Register::RBX => &mut r.rbx,
            Register::RCX => &mut r.rcx,
            Register::RDX => &mut r.rdx,
            Register::RSP => &mut r.rsp,
            Register::RBP => &mut r.rbp,
            Register::RSI => &mut r.rsi,
            Register::RDI => &mut r.rdi,
            Register::R8 => &mut r.r8,
            Register::R9 => &mut r.r9,
            Register::R10 => &mut r.r10,
            Register::R11 => &mut r.r11,
            Register::R12 => &mut r.r12,
            Register::R13 => &mut r.r13,
            Register::R14 => &mut r.r14,
            Register::R15 => &mut r.r15,
            Register::CR0 => &mut self.sregs.cr0,
            Register::CR3 => &mut self.sregs.cr3,
            Register::CR4 => &mut self.sregs.cr4,
            _ => return None,
        })
    }
}

impl CpuStateManager for EmulatorCpuState {
    fn read_reg(&self, reg: Register) -> Result<u64, PlatformError> {
        if !(reg.is_gpr() || reg.is_cr()) {
            return Err(PlatformError::InvalidRegister(anyhow!(
                "read_reg invalid GPR {:?}",
                reg
            )));
        }

        let reg_value = self.gpr_value(reg.full_register()).ok_or_else(|| {
            PlatformError::InvalidRegister(anyhow!("read_reg invalid GPR {:?}", reg))
        })?;

        let reg_value = if reg.is_gpr64() || reg.is_cr() {
            reg_value
        } else if reg.is_gpr32() {
            reg_value & REGISTER_MASK_32
        } else if reg.is_gpr16() {
            reg_value & REGISTER_MASK_16
        } else if is_high_byte(reg) {
            (reg_value >> 8) & REGISTER_MASK_8
        } else {
            reg_value & REGISTER_MASK_8
        };

        debug!("Register read: {:#x} from {:?}", reg_value, reg);

        Ok(reg_value)
    }

    fn write_reg(&mut self, reg: Register, val: u64) -> Result<(), PlatformError> {
        debug!("Register write: {:#x} to {:?}", val, reg);

        // SDM Vol 1 - 3.4.1.1
        //
        // 8-bit and 16-bit operands generate an 8-bit or 16-bit result.
        // The upper 56 bits or 48 bits (respectively) of the destination
        // general-purpose register are not modified by the operation.
        let (reg_value, mask): (u64, u64) = if reg.is_gpr64() || reg.is_cr() {
            (val, !REGISTER_MASK_64)
        } else if reg.is_gpr32() {
            (val & REGISTER_MASK_32, !REGISTER_MASK_64)
        } else if reg.is_gpr16() {
            (val & REGISTER_MASK_16, !REGISTER_MASK_16)
        } else if is_high_byte(reg) {
            ((val & REGISTER_MASK_8) << 8, !(REGISTER_MASK_8 << 8))
        } else if reg.is_gpr8() {
            (val & REGISTER_MASK_8, !REGISTER_MASK_8)
        } else {
            return Err(PlatformError::InvalidRegister(anyhow!(
                "write_reg invalid register {:?}",
                reg
            )));
        };

        let slot = self.gpr(reg.full_register()).ok_or_else(|| {
            PlatformError::InvalidRegister(anyhow!("write_reg invalid register {:?}", reg))
        })?;
        set_reg!(*slot, mask, reg_value);

        Ok(())
    }

    fn read_segment(&self, reg: Register) -> Result<SegmentRegister, PlatformError> {
        match reg {
            Register::CS => Ok(self.sregs.cs),
            Register::DS => Ok(self.sregs.ds),
            Register::SS => Ok(self.sregs.ss),
            r => Err(PlatformError::InvalidRegister(anyhow!(
                "read_segment invalid register {:?}",
                r
            ))),
        }
    }

    fn ip(&self) -> u64 {
        self.regs.rip
    }

    fn set_ip(&mut self, ip: u64) {
        self.regs.rip = ip;
    }

    fn efer(&self) -> u64 {
        self.sregs.efer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_reg_widths() {
        let mut state = EmulatorCpuState::long_mode();
        state.regs.rax = 0x1111_2222_3333_4444;

        state.write_reg(Register::AL, 0xab).unwrap();
        assert_eq!(state.regs.rax, 0x1111_2222_3333_44ab);

        state.write_reg(Register::AH, 0xcd).unwrap();
        assert_eq!(state.regs.rax, 0x1111_2222_3333_cdab);

        state.write_reg(Register::AX, 0x1_beef).unwrap();
        assert_eq!(state.regs.rax, 0x1111_2222_3333_beef);

        // 32-bit results are zero-extended.
        state.write_reg(Register::EAX, 0xfeed_face).unwrap();
        assert_eq!(state.regs.rax, 0x0000_0000_feed_face);

        state.write_reg(Register::R9, u64::MAX).unwrap();
        assert_eq!(state.regs.r9, u64::MAX);
        state.write_reg(Register::R9L, 0).unwrap();
        assert_eq!(state.regs.r9, 0xffff_ffff_ffff_ff00);
    }

    #[test]
    fn test_read_reg_widths() {
        let mut state = EmulatorCpuState::long_mode();
        state.regs.rbx = 0x1122_3344_5566_7788;
        assert_eq!(state.read_reg(Register::RBX).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(state.read_reg(Register::EBX).unwrap(), 0x5566_7788);
        assert_eq!(state.read_reg(Register::BX).unwrap(), 0x7788);
        assert_eq!(state.read_reg(Register::BL).unwrap(), 0x88);
        assert_eq!(state.read_reg(Register::BH).unwrap(), 0x77);
        assert!(state.read_reg(Register::XMM0).is_err());
        assert!(state.write_reg(Register::XMM0, 0).is_err());
    }

    #[test]
    fn test_bitness() {
        let mut state = EmulatorCpuState::long_mode();
        assert_eq!(state.bitness().unwrap(), 64);

        state.sregs.cs.l = 0;
        state.sregs.cs.db = 1;
        assert_eq!(state.bitness().unwrap(), 32);

        state.sregs.cr0 = 0;
        assert_eq!(state.bitness().unwrap(), 16);

        let mut state = EmulatorCpuState::long_mode();
        state.sregs.cs.db = 1;
        assert!(state.bitness().is_err());
    }

    #[test]
    fn test_accumulator() {
        assert_eq!(accumulator(1), Some(Register::AL));
        assert_eq!(accumulator(4), Some(Register::EAX));
        assert_eq!(accumulator(3), None);
        assert_eq!(operand_mask(2), 0xffff);
    }
}
