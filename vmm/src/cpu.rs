// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

use std::sync::Arc;

use hypervisor::{
    CpuStateManager, EmulationError, EmulatorCpuState, IoExitQualification, MmioInstruction,
    MmioOperation, PlatformError, Register, VmExit,
};
use thiserror::Error;
use vm_device::IoRequest;

use crate::io_emul::{self, IoOutcome};
use crate::ioreq;
use crate::vm::{Vm, VmState};

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O emulation failed: {0}")]
    Emulation(#[source] io_emul::Error),

    #[error("Cannot decode the MMIO instruction: {0}")]
    Decode(#[source] EmulationError),

    #[error("VM is shutting down")]
    VmShuttingDown,

    #[error("Error accessing a vCPU register: {0}")]
    Register(#[source] PlatformError),

    #[error("Invalid vCPU id {0}")]
    InvalidVcpu(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

fn emulation_error(vm: &Vm, e: io_emul::Error) -> Error {
    match e {
        io_emul::Error::DeviceModel(ioreq::Error::Discarded(_)) => Error::VmShuttingDown,
        io_emul::Error::VmNotRunning if vm.state() == VmState::ShuttingDown => {
            Error::VmShuttingDown
        }
        e => Error::Emulation(e),
    }
}

/// A virtual CPU as seen by the I/O emulation path.
///
/// Owns the register state and the single I/O request slot of the vCPU.
/// Exits are handled on the vCPU's own thread; a request deferred to the
/// device model blocks that thread until it completes.
pub struct Vcpu {
    id: usize,
    vm: Arc<Vm>,
    state: EmulatorCpuState,
    io_req: IoRequest,
    // Instruction behind the MMIO request in flight.
    mmio_insn: Option<MmioInstruction>,
}

impl Vcpu {
    /// Constructs a new vCPU for `vm`.
    ///
    /// # Arguments
    ///
    /// * `id` - Index of the vCPU, below the configured vCPU count.
    /// * `vm` - The virtual machine this vCPU belongs to.
    /// * `state` - Initial register state.
    pub fn new(id: usize, vm: Arc<Vm>, state: EmulatorCpuState) -> Result<Self> {
        if id >= vm.config().vcpus {
            return Err(Error::InvalidVcpu(id));
        }

        Ok(Vcpu {
            id,
            vm,
            state,
            io_req: IoRequest::default(),
            mmio_insn: None,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> &EmulatorCpuState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut EmulatorCpuState {
        &mut self.state
    }

    pub fn io_request(&self) -> &IoRequest {
        &self.io_req
    }

    /// Emulates the access behind `exit` and leaves the vCPU ready to
    /// re-enter the guest.
    pub fn handle_exit(&mut self, exit: &VmExit) -> Result<IoOutcome> {
        if self.vm.state() == VmState::ShuttingDown {
            return Err(Error::VmShuttingDown);
        }

        match *exit {
            VmExit::IoInstruction {
                qualification,
                instruction_len,
            } => self.pio_instr_vmexit_handler(qualification, instruction_len),
            VmExit::MmioAccess { gpa, insn } => self.mmio_vmexit_handler(gpa, insn),
        }
    }

    fn pio_instr_vmexit_handler(
        &mut self,
        qualification: IoExitQualification,
        instruction_len: u32,
    ) -> Result<IoOutcome> {
        if qualification.is_string() || qualification.is_rep() {
            error!(
                "vCPU {}: string port I/O is not emulated ({:#x})",
                self.id, qualification.0
            );
            return Err(Error::Emulation(io_emul::Error::InvalidRequest(
                "string port I/O",
            )));
        }

        let port = qualification.port();
        let size = qualification.size();
        debug!(
            "vCPU {}: {} port {:#x} size {} ({} operand)",
            self.id,
            if qualification.is_in() { "in" } else { "out" },
            port,
            size,
            if qualification.is_immediate() { "imm8" } else { "dx" }
        );
        self.io_req = if qualification.is_in() {
            IoRequest::pio_read(port, size)
        } else {
            let rax = self
                .state
                .read_reg(Register::RAX)
                .map_err(Error::Register)?;
            IoRequest::pio_write(port, size, rax)
        };

        let outcome = self.emulate_io()?;
        if outcome != IoOutcome::Passthrough {
            let rip = self.state.ip().wrapping_add(u64::from(instruction_len));
            self.state.set_ip(rip);
        }
        Ok(outcome)
    }

    fn mmio_vmexit_handler(&mut self, gpa: u64, insn_bytes: &[u8]) -> Result<IoOutcome> {
        let insn = MmioInstruction::decode(&self.state, insn_bytes).map_err(Error::Decode)?;
        debug!(
            "vCPU {}: {:?} of {} bytes at {:#x}",
            self.id, insn.mnemonic, insn.size, gpa
        );

        self.io_req = match insn.operation {
            MmioOperation::Load { .. } => IoRequest::mmio_read(gpa, insn.size),
            MmioOperation::Store { value } => IoRequest::mmio_write(gpa, insn.size, value),
        };
        self.mmio_insn = Some(insn);

        self.emulate_io()
    }

    /// Dispatches the populated request and finishes it, waiting for the
    /// device model if needed.
    fn emulate_io(&mut self) -> Result<IoOutcome> {
        let result = self.dispatch_and_complete();
        if result.is_err() {
            self.io_req.reset();
        }
        self.mmio_insn = None;
        result
    }

    fn dispatch_and_complete(&mut self) -> Result<IoOutcome> {
        let outcome = io_emul::dispatch_io_request(&self.vm, self.id, &mut self.io_req)
            .map_err(|e| emulation_error(&self.vm, e))?;

        match outcome {
            IoOutcome::Passthrough => {
                self.io_req.reset();
                return Ok(outcome);
            }
            IoOutcome::Deferred => {
                debug!("vCPU {} waiting for the device model", self.id);
                io_emul::wait_device_model(&self.vm, self.id, &mut self.io_req)
                    .map_err(|e| emulation_error(&self.vm, e))?;
            }
            IoOutcome::Handled => {}
        }

        io_emul::emulate_io_post(&mut self.io_req, self.mmio_insn.as_ref(), &mut self.state)
            .map_err(Error::Emulation)?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoadOrder, VmConfig};
    use std::sync::Mutex;
    use std::thread;
    use vm_device::{BusRange, HandlerResult, MmioHandler, PioHandler, PioIndex};

    #[derive(Default)]
    struct Recorder {
        last: Mutex<Option<IoRequest>>,
    }

    impl PioHandler for Recorder {
        fn pio_read(&self, _port: u16, _size: u8) -> HandlerResult<u32> {
            Ok(0x8765_4321)
        }

        fn pio_write(&self, port: u16, size: u8, value: u32) -> HandlerResult<()> {
            *self.last.lock().unwrap() = Some(IoRequest::pio_write(port, size, u64::from(value)));
            Ok(())
        }
    }

    impl MmioHandler for Recorder {
        fn mmio_access(&self, req: &mut IoRequest) -> HandlerResult<()> {
            if req.is_read() {
                req.value = 0x1122_3344_5566_7788;
            }
            *self.last.lock().unwrap() = Some(*req);
            Ok(())
        }
    }

    fn running_vm(load_order: LoadOrder, recorder: &Arc<Recorder>) -> Arc<Vm> {
        let vm = Vm::new(VmConfig {
            load_order,
            vcpus: 2,
            ..Default::default()
        })
        .unwrap();
        vm.register_pio_handler(
            PioIndex::Uart,
            BusRange {
                base: 0x3f8,
                len: 8,
            },
            recorder.clone(),
        )
        .unwrap();
        vm.register_mmio_handler(recorder.clone(), 0xd000_0000, 0xd000_1000)
            .unwrap();
        vm.launch().unwrap();
        Arc::new(vm)
    }

    fn vcpu(vm: &Arc<Vm>, id: usize) -> Vcpu {
        let mut state = EmulatorCpuState::long_mode();
        state.regs.rip = 0x1000;
        Vcpu::new(id, vm.clone(), state).unwrap()
    }

    fn pio_exit(port: u16, size: u8, is_in: bool) -> VmExit<'static> {
        VmExit::IoInstruction {
            qualification: IoExitQualification::new(port, size, is_in),
            instruction_len: 1,
        }
    }

    #[test]
    fn test_pio_in_handled() {
        let recorder = Arc::new(Recorder::default());
        let vm = running_vm(LoadOrder::PostLaunched, &recorder);
        let mut vcpu = vcpu(&vm, 0);
        vcpu.state_mut().regs.rax = 0xffff_ffff_ffff_ffff;

        let outcome = vcpu.handle_exit(&pio_exit(0x3f8, 2, true)).unwrap();
        assert_eq!(outcome, IoOutcome::Handled);
        assert_eq!(vcpu.state().regs.rax, 0xffff_ffff_ffff_4321);
        assert_eq!(vcpu.state().regs.rip, 0x1001);
        assert_eq!(*vcpu.io_request(), IoRequest::default());
    }

    #[test]
    fn test_pio_out_masks_rax() {
        let recorder = Arc::new(Recorder::default());
        let vm = running_vm(LoadOrder::PostLaunched, &recorder);
        let mut vcpu = vcpu(&vm, 0);
        vcpu.state_mut().regs.rax = 0xaaaa_bbbb_cccc_dd5a;

        vcpu.handle_exit(&pio_exit(0x3f9, 1, false)).unwrap();
        let last = recorder.last.lock().unwrap().unwrap();
        assert_eq!(last.address, 0x3f9);
        assert_eq!(last.value, 0x5a);
        assert_eq!(vcpu.state().regs.rax, 0xaaaa_bbbb_cccc_dd5a);
    }

    #[test]
    fn test_pio_string_rejected() {
        let recorder = Arc::new(Recorder::default());
        let vm = running_vm(LoadOrder::PostLaunched, &recorder);
        let mut vcpu = vcpu(&vm, 0);

        // rep outsb to 0x3f8
        let exit = VmExit::IoInstruction {
            qualification: IoExitQualification(0x03f8_0030),
            instruction_len: 2,
        };
        assert!(matches!(
            vcpu.handle_exit(&exit),
            Err(Error::Emulation(io_emul::Error::InvalidRequest(_)))
        ));
        assert_eq!(vcpu.state().regs.rip, 0x1000);
    }

    #[test]
    fn test_pio_span_is_fatal() {
        let recorder = Arc::new(Recorder::default());
        let vm = running_vm(LoadOrder::PostLaunched, &recorder);
        let mut vcpu = vcpu(&vm, 0);

        assert!(matches!(
            vcpu.handle_exit(&pio_exit(0x3fe, 4, true)),
            Err(Error::Emulation(io_emul::Error::SpansMultipleDevices { .. }))
        ));
        assert_eq!(vcpu.state().regs.rip, 0x1000);
        assert_eq!(*vcpu.io_request(), IoRequest::default());
    }

    #[test]
    fn test_pio_passthrough() {
        let recorder = Arc::new(Recorder::default());
        let vm = running_vm(LoadOrder::PostLaunched, &recorder);
        vm.allow_passthrough_pio(0x3f8, 8);
        let mut vcpu = vcpu(&vm, 0);

        let outcome = vcpu.handle_exit(&pio_exit(0x3f8, 1, false)).unwrap();
        assert_eq!(outcome, IoOutcome::Passthrough);
        assert!(recorder.last.lock().unwrap().is_none());
        assert_eq!(vcpu.state().regs.rip, 0x1000);
    }

    #[test]
    fn test_mmio_load() {
        let recorder = Arc::new(Recorder::default());
        let vm = running_vm(LoadOrder::PostLaunched, &recorder);
        let mut vcpu = vcpu(&vm, 0);
        vcpu.state_mut().regs.rax = u64::MAX;

        // mov eax, [rbx]
        let exit = VmExit::MmioAccess {
            gpa: 0xd000_0010,
            insn: &[0x8b, 0x03],
        };
        assert_eq!(vcpu.handle_exit(&exit).unwrap(), IoOutcome::Handled);
        assert_eq!(vcpu.state().regs.rax, 0x5566_7788);
        assert_eq!(vcpu.state().regs.rip, 0x1002);
    }

    #[test]
    fn test_mmio_store_immediate() {
        let recorder = Arc::new(Recorder::default());
        let vm = running_vm(LoadOrder::PostLaunched, &recorder);
        let mut vcpu = vcpu(&vm, 0);

        // mov byte [rbx], 0x5a
        let exit = VmExit::MmioAccess {
            gpa: 0xd000_0020,
            insn: &[0xc6, 0x03, 0x5a],
        };
        assert_eq!(vcpu.handle_exit(&exit).unwrap(), IoOutcome::Handled);
        let last = recorder.last.lock().unwrap().unwrap();
        assert_eq!(last.address, 0xd000_0020);
        assert_eq!(last.size, 1);
        assert_eq!(last.value, 0x5a);
        assert_eq!(vcpu.state().regs.rip, 0x1003);
    }

    #[test]
    fn test_mmio_bad_instruction() {
        let recorder = Arc::new(Recorder::default());
        let vm = running_vm(LoadOrder::PostLaunched, &recorder);
        let mut vcpu = vcpu(&vm, 0);

        // add [rbx], eax
        let exit = VmExit::MmioAccess {
            gpa: 0xd000_0000,
            insn: &[0x01, 0x03],
        };
        assert!(matches!(vcpu.handle_exit(&exit), Err(Error::Decode(_))));
        assert!(recorder.last.lock().unwrap().is_none());
    }

    #[test]
    fn test_deferred_round_trip() {
        let recorder = Arc::new(Recorder::default());
        let vm = running_vm(LoadOrder::PostLaunched, &recorder);
        let client = vm.device_model_client().unwrap();
        let mut vcpu = vcpu(&vm, 1);

        let device_model = thread::spawn(move || loop {
            client.wait().unwrap();
            let pending = client.pending().unwrap();
            if let Some(&id) = pending.first() {
                let req = client.claim(id).unwrap();
                assert_eq!(req.address, 0x64);
                client.complete(id, 0x1d).unwrap();
                break;
            }
        });

        let outcome = vcpu.handle_exit(&pio_exit(0x64, 1, true)).unwrap();
        device_model.join().unwrap();

        assert_eq!(outcome, IoOutcome::Deferred);
        assert_eq!(vcpu.state().regs.rax & 0xff, 0x1d);
        assert_eq!(vcpu.state().regs.rip, 0x1001);
        assert!(vm.device_model_client().unwrap().pending().unwrap().is_empty());
    }

    #[test]
    fn test_shutdown_wakes_deferred_vcpu() {
        let recorder = Arc::new(Recorder::default());
        let vm = running_vm(LoadOrder::PostLaunched, &recorder);
        let client = vm.device_model_client().unwrap();
        let mut vcpu = vcpu(&vm, 0);

        let vcpu_thread = thread::spawn(move || {
            let result = vcpu.handle_exit(&pio_exit(0x60, 1, true));
            (result, vcpu)
        });

        // Wait until the request shows up, then tear the VM down.
        while client.pending().unwrap().is_empty() {
            client.wait().unwrap();
        }
        vm.shutdown().unwrap();

        let (result, vcpu) = vcpu_thread.join().unwrap();
        assert!(matches!(result, Err(Error::VmShuttingDown)));
        assert_eq!(vcpu.state().regs.rip, 0x1000);
        assert!(matches!(
            client.complete(0, 0),
            Err(ioreq::Error::NoOutstandingRequest(0))
        ));

        let mut vcpu = vcpu;
        assert!(matches!(
            vcpu.handle_exit(&pio_exit(0x60, 1, true)),
            Err(Error::VmShuttingDown)
        ));
    }

    #[test]
    fn test_not_running_after_shutdown() {
        let vm = Arc::new(Vm::new(VmConfig::default()).unwrap());
        assert!(matches!(
            emulation_error(&vm, io_emul::Error::VmNotRunning),
            Error::Emulation(io_emul::Error::VmNotRunning)
        ));

        // The state check and the dispatch may straddle the shutdown.
        vm.launch().unwrap();
        vm.shutdown().unwrap();
        assert!(matches!(
            emulation_error(&vm, io_emul::Error::VmNotRunning),
            Error::VmShuttingDown
        ));
    }

    #[test]
    fn test_no_device_model_floats_high() {
        let recorder = Arc::new(Recorder::default());
        let vm = running_vm(LoadOrder::PreLaunched, &recorder);
        let mut vcpu = vcpu(&vm, 0);

        assert_eq!(
            vcpu.handle_exit(&pio_exit(0x80, 4, true)).unwrap(),
            IoOutcome::Handled
        );
        assert_eq!(vcpu.state().regs.rax, 0xffff_ffff);
    }

    #[test]
    fn test_invalid_vcpu() {
        let recorder = Arc::new(Recorder::default());
        let vm = running_vm(LoadOrder::PostLaunched, &recorder);
        assert!(matches!(
            Vcpu::new(2, vm, EmulatorCpuState::default()),
            Err(Error::InvalidVcpu(2))
        ));
    }
}
