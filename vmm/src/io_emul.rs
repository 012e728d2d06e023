// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

//! Routing of trapped guest I/O and write-back of its results.
//!
//! A request is resolved synchronously by an internal handler, passed
//! through to hardware, or handed to the external device model and
//! completed later. Either way it ends up `Completed`, and the
//! post-processing step then updates the trapping vCPU's registers and
//! frees the request.

use hypervisor::{CpuStateManager, EmulationError, MmioInstruction, PlatformError};
use thiserror::Error;
use vm_device::{IoHandlerRegistry, IoRequest, IoRequestKind, RequestState, Resolution};

use crate::ioreq;
use crate::vm::Vm;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid I/O request: {0}")]
    InvalidRequest(&'static str),

    #[error("{kind} access at {address:#x} size {size} spans multiple devices")]
    SpansMultipleDevices {
        kind: IoRequestKind,
        address: u64,
        size: u8,
    },

    #[error("Emulation handler failed: {0}")]
    Handler(#[source] vm_device::Error),

    #[error("Request is {0:?}, not completed")]
    RequestNotCompleted(RequestState),

    #[error("Expected a {expected} request, found {found}")]
    KindMismatch {
        expected: IoRequestKind,
        found: IoRequestKind,
    },

    #[error("Device model error: {0}")]
    DeviceModel(#[source] ioreq::Error),

    #[error("VM is not running")]
    VmNotRunning,

    #[error("Error writing the result to the guest: {0}")]
    Register(#[source] PlatformError),

    #[error("Error completing the MMIO instruction: {0}")]
    Instruction(#[source] EmulationError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Successful disposition of a dispatched request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoOutcome {
    /// Resolved synchronously, the request is `Completed`.
    Handled,
    /// Pending with the device model.
    Deferred,
    /// Every accessed port is passed through, nothing was emulated.
    Passthrough,
}

/// Routes the populated request of `vcpu_id`.
///
/// On `Handled` the request is `Completed` and ready for
/// [`emulate_io_post`]. On `Deferred` it is `Pending` and must be finished
/// with [`wait_device_model`] first. Errors leave the request untouched.
pub fn dispatch_io_request(vm: &Vm, vcpu_id: usize, req: &mut IoRequest) -> Result<IoOutcome> {
    req.check_shape().map_err(Error::InvalidRequest)?;
    if req.state != RequestState::Free {
        return Err(Error::InvalidRequest("another request is in flight"));
    }

    let handlers = vm.handlers().ok_or(Error::VmNotRunning)?;

    let resolution = match req.kind {
        IoRequestKind::PortIo => {
            if vm.port_bitmap().covers(req.address, u64::from(req.size)) {
                debug!("Port {:#x} size {} passed through", req.address, req.size);
                return Ok(IoOutcome::Passthrough);
            }
            handlers.pio.emulate(req)
        }
        IoRequestKind::Mmio => handlers.mmio.emulate(req),
    }
    .map_err(Error::Handler)?;

    match resolution {
        Resolution::Handled => {
            req.state = RequestState::Completed;
            Ok(IoOutcome::Handled)
        }
        Resolution::SpansMultipleDevices => Err(Error::SpansMultipleDevices {
            kind: req.kind,
            address: req.address,
            size: req.size,
        }),
        Resolution::Unclaimed => match vm.device_model() {
            Some(channel) => {
                channel.insert(vcpu_id, req).map_err(Error::DeviceModel)?;
                req.state = RequestState::Pending;
                Ok(IoOutcome::Deferred)
            }
            None => {
                // Nothing decodes the access: reads float high and writes
                // go nowhere.
                debug!("Unclaimed access completed as open bus: {}", req);
                if req.is_read() {
                    req.set_value(u64::MAX);
                }
                req.state = RequestState::Completed;
                Ok(IoOutcome::Handled)
            }
        },
    }
}

/// Blocks until the device model completed the deferred request of
/// `vcpu_id`, then copies the result into `req` and releases the shared slot.
pub fn wait_device_model(vm: &Vm, vcpu_id: usize, req: &mut IoRequest) -> Result<()> {
    if req.state != RequestState::Pending {
        return Err(Error::RequestNotCompleted(req.state));
    }
    let channel = vm
        .device_model()
        .ok_or(Error::InvalidRequest("VM has no device model"))?;

    let done = channel.wait_completion(vcpu_id).map_err(|e| {
        if let ioreq::Error::Discarded(_) = e {
            // Nobody will resume this vCPU, there is nothing to post-process.
            req.reset();
        }
        Error::DeviceModel(e)
    })?;

    if req.is_read() {
        req.set_value(done.value);
    }
    req.state = RequestState::Completed;
    Ok(())
}

fn check_completed(req: &IoRequest, expected: IoRequestKind) -> Result<()> {
    if req.state != RequestState::Completed {
        return Err(Error::RequestNotCompleted(req.state));
    }
    if req.kind != expected {
        return Err(Error::KindMismatch {
            expected,
            found: req.kind,
        });
    }
    Ok(())
}

/// Loads the result of a completed `in` into the accumulator.
pub fn emulate_pio_post<T: CpuStateManager>(req: &mut IoRequest, state: &mut T) -> Result<()> {
    check_completed(req, IoRequestKind::PortIo)?;

    if req.is_read() {
        let reg = hypervisor::arch::x86::emulator::accumulator(req.size)
            .ok_or(Error::InvalidRequest("unsupported access size"))?;
        state.write_reg(reg, req.value).map_err(Error::Register)?;
    }

    req.reset();
    Ok(())
}

/// Finishes the instruction behind a completed MMIO access: loads the
/// destination register on a read and moves the IP past the instruction.
pub fn emulate_mmio_post<T: CpuStateManager>(
    req: &mut IoRequest,
    insn: &MmioInstruction,
    state: &mut T,
) -> Result<()> {
    check_completed(req, IoRequestKind::Mmio)?;
    if insn.size != req.size || insn.is_load() != req.is_read() {
        return Err(Error::InvalidRequest(
            "request does not match the decoded instruction",
        ));
    }

    if req.is_read() {
        insn.write_back(state, req.value)
            .map_err(Error::Instruction)?;
    }
    insn.retire(state);

    req.reset();
    Ok(())
}

/// Post-processing entry point, selected by the request kind.
pub fn emulate_io_post<T: CpuStateManager>(
    req: &mut IoRequest,
    mmio_insn: Option<&MmioInstruction>,
    state: &mut T,
) -> Result<()> {
    match req.kind {
        IoRequestKind::PortIo => emulate_pio_post(req, state),
        IoRequestKind::Mmio => {
            let insn = mmio_insn.ok_or(Error::InvalidRequest(
                "MMIO completion without a decoded instruction",
            ))?;
            emulate_mmio_post(req, insn, state)
        }
    }
}
