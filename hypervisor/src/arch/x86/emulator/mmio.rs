//
// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//
// MOV/MOVZX against an emulated MMIO location
// SDM Volume 1, Chapter 4.3
//
// A guest load or store hitting an MMIO range faults on the EPT and is
// serviced in software: the faulting instruction is decoded to learn the
// access width and operands, and is retired once the access completed.
//

use crate::arch::emulator::{EmulationError, EmulationResult};
use crate::arch::x86::emulator::{operand_mask, CpuStateManager};
use iced_x86::*;

/// Longest x86 instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// What the trapping instruction does with the MMIO location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmioOperation {
    /// Loads into `dest`, zero-extended for `movzx`.
    Load { dest: Register },
    /// Stores `value` (register or immediate source, already truncated).
    Store { value: u64 },
}

/// Decoded MMIO instruction, kept by the vCPU until the access completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmioInstruction {
    pub mnemonic: Mnemonic,
    pub operation: MmioOperation,
    /// Access width in bytes.
    pub size: u8,
    /// Instruction length in bytes.
    pub len: u8,
}

fn is_immediate(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64
    )
}

impl MmioInstruction {
    /// Decodes the instruction at the current IP from `insn_bytes`.
    ///
    /// Store sources are read from `state` right away.
    pub fn decode<T: CpuStateManager>(state: &T, insn_bytes: &[u8]) -> EmulationResult<Self> {
        let bitness = state
            .bitness()
            .map_err(EmulationError::PlatformEmulationError)?;
        let bytes = &insn_bytes[..insn_bytes.len().min(MAX_INSTRUCTION_LEN)];
        let mut decoder = Decoder::with_ip(bitness, bytes, state.ip(), DecoderOptions::NONE);
        let insn = decoder.decode();

        if insn.is_invalid() {
            return Err(EmulationError::InstructionDecodingError(anyhow!(
                "{:?} at {:#x}: {:x?}",
                decoder.last_error(),
                state.ip(),
                bytes
            )));
        }

        let mnemonic = insn.mnemonic();
        if !matches!(mnemonic, Mnemonic::Mov | Mnemonic::Movzx) {
            return Err(EmulationError::UnsupportedInstruction(anyhow!(
                "{:?} at {:#x}",
                insn.code(),
                state.ip()
            )));
        }

        if insn.op_count() != 2 {
            return Err(EmulationError::WrongNumberOperands(anyhow!(
                "{:?} has {} operands",
                insn.code(),
                insn.op_count()
            )));
        }

        if insn.op0_kind() != OpKind::Memory && insn.op1_kind() != OpKind::Memory {
            return Err(EmulationError::InvalidOperand(anyhow!(
                "{:?} has no memory operand",
                insn.code()
            )));
        }

        let size = insn.memory_size().size();
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(EmulationError::UnsupportedMemorySize(anyhow!(
                "{} bytes for {:?}",
                size,
                insn.code()
            )));
        }
        let mask = operand_mask(size);

        let operation = match (insn.op0_kind(), insn.op1_kind()) {
            (OpKind::Register, OpKind::Memory) => MmioOperation::Load {
                dest: insn.op0_register(),
            },
            (OpKind::Memory, OpKind::Register) if mnemonic == Mnemonic::Mov => {
                let value = state
                    .read_reg(insn.op1_register())
                    .map_err(EmulationError::PlatformEmulationError)?;
                MmioOperation::Store {
                    value: value & mask,
                }
            }
            (OpKind::Memory, kind) if is_immediate(kind) => MmioOperation::Store {
                value: insn.immediate(1) & mask,
            },
            (op0, op1) => {
                return Err(EmulationError::InvalidOperand(anyhow!(
                    "{:?} with operands {:?}, {:?}",
                    insn.code(),
                    op0,
                    op1
                )))
            }
        };

        debug!(
            "Decoded MMIO instruction {:?} ({} bytes): {:?} size {}",
            insn.code(),
            insn.len(),
            operation,
            size
        );

        Ok(MmioInstruction {
            mnemonic,
            operation,
            size: size as u8,
            len: insn.len() as u8,
        })
    }

    pub fn is_load(&self) -> bool {
        matches!(self.operation, MmioOperation::Load { .. })
    }

    /// Loads `value` into the destination register, if this is a load.
    pub fn write_back<T: CpuStateManager>(&self, state: &mut T, value: u64) -> EmulationResult<()> {
        if let MmioOperation::Load { dest } = self.operation {
            state
                .write_reg(dest, value & operand_mask(usize::from(self.size)))
                .map_err(EmulationError::PlatformEmulationError)?;
        }
        Ok(())
    }

    /// Moves the IP past the instruction.
    pub fn retire<T: CpuStateManager>(&self, state: &mut T) {
        state.set_ip(state.ip().wrapping_add(u64::from(self.len)));
    }
}
