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

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use thiserror::Error;
use vm_device::bitmap::PIO_SPACE_SIZE;
use vm_device::{
    BusRange, MmioBus, MmioHandler, PioHandler, PioHandlerTable, PioIndex, PortBitmap,
};

use crate::config::{LoadOrder, ValidationError, VmConfig};
use crate::ioreq::{self, IoReqChannel, IoReqClient};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid VM configuration: {0}")]
    Config(#[source] ValidationError),

    #[error("Device model channel error: {0}")]
    DeviceModel(#[source] ioreq::Error),

    #[error("Invalid VM state transition: {0} to {1}")]
    InvalidStateTransition(VmState, VmState),
}

pub type Result<T> = std::result::Result<T, Error>;

/// VM lifecycle as seen by the I/O emulation tables.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmState {
    /// Handlers may be registered.
    Configuring = 0,
    /// Tables are frozen and accesses are dispatched.
    Running = 1,
    ShuttingDown = 2,
}

impl VmState {
    fn from_raw(raw: u8) -> VmState {
        match raw {
            0 => VmState::Configuring,
            1 => VmState::Running,
            _ => VmState::ShuttingDown,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Handler registries of a VM.
///
/// Built up while the VM is configured, then frozen at launch and read
/// without locking on the dispatch path.
pub struct IoHandlers {
    pub pio: PioHandlerTable,
    pub mmio: MmioBus,
}

pub struct Vm {
    config: VmConfig,
    state: AtomicU8,
    // Some until launch.
    staging: Mutex<Option<IoHandlers>>,
    handlers: OnceLock<IoHandlers>,
    port_bitmap: PortBitmap,
    device_model: Option<IoReqChannel>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Result<Self> {
        config.validate().map_err(Error::Config)?;

        let port_bitmap = PortBitmap::new();
        if config.load_order == LoadOrder::ServiceVm {
            // The service VM owns the platform: every port is its own
            // until an emulated range claims it back.
            port_bitmap.allow(0, PIO_SPACE_SIZE);
        }
        for range in config.passthrough_pio.iter() {
            port_bitmap.allow(range.base, range.len);
        }

        let device_model = if config.load_order.has_device_model() {
            Some(IoReqChannel::new(config.vcpus).map_err(Error::DeviceModel)?)
        } else {
            None
        };

        info!(
            "VM {} created: {} vCPU(s), {:?}",
            config.name, config.vcpus, config.load_order
        );

        Ok(Vm {
            staging: Mutex::new(Some(IoHandlers {
                pio: PioHandlerTable::new(),
                mmio: MmioBus::new(config.max_emulated_mmio_regions),
            })),
            config,
            state: AtomicU8::new(VmState::Configuring as u8),
            handlers: OnceLock::new(),
            port_bitmap,
            device_model,
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn state(&self) -> VmState {
        VmState::from_raw(self.state.load(Ordering::SeqCst))
    }

    fn staging(&self) -> MutexGuard<'_, Option<IoHandlers>> {
        // The tables stay consistent across a panicking registrant.
        self.staging.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds a port I/O handler to one of the fixed emulation slots.
    ///
    /// Whatever the slot held is replaced. For the service VM the range
    /// stops being passed through.
    pub fn register_pio_handler(
        &self,
        index: PioIndex,
        range: BusRange,
        handler: Arc<dyn PioHandler>,
    ) -> vm_device::Result<()> {
        if range.len == 0 || range.end() > u64::from(PIO_SPACE_SIZE) {
            return Err(vm_device::Error::InvalidArgument(
                "port range outside the port space",
            ));
        }

        let mut staging = self.staging();
        let handlers = staging
            .as_mut()
            .ok_or(vm_device::Error::InvalidArgument("VM already launched"))?;
        handlers.pio.register(index, range, handler);

        if self.config.load_order == LoadOrder::ServiceVm {
            debug!(
                "Revoking passthrough of emulated ports [{:#x}, {:#x})",
                range.base,
                range.end()
            );
            self.port_bitmap.deny(range.base as u16, range.len as u32);
        }

        Ok(())
    }

    /// Claims guest-physical `[start, end)` for `handler`.
    pub fn register_mmio_handler(
        &self,
        handler: Arc<dyn MmioHandler>,
        start: u64,
        end: u64,
    ) -> vm_device::Result<()> {
        let mut staging = self.staging();
        let handlers = staging.as_mut().ok_or_else(|| {
            error!(
                "VM {}: MMIO handler for [{:#x}, {:#x}) registered after launch",
                self.config.name, start, end
            );
            vm_device::Error::InvalidArgument("VM already launched")
        })?;
        handlers.mmio.insert(handler, start, end)
    }

    /// Lets the guest access `[port, port + nbytes)` directly. Takes effect
    /// immediately, also on a running VM.
    pub fn allow_passthrough_pio(&self, port: u16, nbytes: u32) {
        debug!(
            "VM {}: passthrough granted for {:#x}+{:#x}",
            self.config.name, port, nbytes
        );
        self.port_bitmap.allow(port, nbytes);
    }

    /// Traps `[port, port + nbytes)` again.
    pub fn deny_passthrough_pio(&self, port: u16, nbytes: u32) {
        debug!(
            "VM {}: passthrough revoked for {:#x}+{:#x}",
            self.config.name, port, nbytes
        );
        self.port_bitmap.deny(port, nbytes);
    }

    pub fn port_bitmap(&self) -> &PortBitmap {
        &self.port_bitmap
    }

    /// Freezes the handler tables and starts dispatching.
    pub fn launch(&self) -> Result<()> {
        let mut staging = self.staging();
        let handlers = staging
            .take()
            .ok_or_else(|| Error::InvalidStateTransition(self.state(), VmState::Running))?;

        if self.handlers.set(handlers).is_err() {
            return Err(Error::InvalidStateTransition(self.state(), VmState::Running));
        }
        self.state.store(VmState::Running as u8, Ordering::SeqCst);

        info!("VM {} launched", self.config.name);
        Ok(())
    }

    /// Stops dispatching and discards requests still outstanding with the
    /// device model. Their vCPUs are woken and never resumed.
    pub fn shutdown(&self) -> Result<()> {
        let mut staging = self.staging();
        let previous = self.state.swap(VmState::ShuttingDown as u8, Ordering::SeqCst);
        if VmState::from_raw(previous) == VmState::ShuttingDown {
            return Ok(());
        }
        staging.take();
        drop(staging);

        if let Some(channel) = &self.device_model {
            channel.shutdown().map_err(Error::DeviceModel)?;
        }

        info!("VM {} shutting down", self.config.name);
        Ok(())
    }

    /// Frozen tables, only while running.
    pub fn handlers(&self) -> Option<&IoHandlers> {
        if self.state() != VmState::Running {
            return None;
        }
        self.handlers.get()
    }

    pub fn device_model(&self) -> Option<&IoReqChannel> {
        self.device_model.as_ref()
    }

    /// Handle for the external device model, if the VM has one.
    pub fn device_model_client(&self) -> Option<IoReqClient> {
        self.device_model.as_ref().map(|c| c.client())
    }
}
