// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

//! Shared request page between the vCPUs and the external device model.
//!
//! Every vCPU owns one slot. A vCPU whose access was not claimed by any
//! internal handler copies its request into the slot and blocks on its
//! completion event. The device model is kicked through a single
//! notification event, claims pending slots, emulates them and completes
//! them, which wakes the owning vCPU.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use vm_device::{IoRequest, RequestState};
use vmm_sys_util::eventfd::EventFd;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No outstanding request for vCPU {0}")]
    NoOutstandingRequest(usize),

    #[error("Request slot of vCPU {0} is busy")]
    SlotBusy(usize),

    #[error("Invalid vCPU id {0}")]
    InvalidVcpu(usize),

    #[error("Error with eventfd: {0}")]
    EventFd(#[source] io::Error),

    #[error("Request of vCPU {0} was discarded at shutdown")]
    Discarded(usize),

    #[error("Request slot lock poisoned")]
    PoisonedSlot,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Default)]
struct Slot {
    request: IoRequest,
    /// Set when shutdown dropped the request, cleared by the waiter.
    discarded: bool,
}

struct Shared {
    slots: Vec<Mutex<Slot>>,
    completions: Vec<EventFd>,
    notify: EventFd,
    shutdown: AtomicBool,
}

impl Shared {
    fn slot(&self, vcpu_id: usize) -> Result<MutexGuard<'_, Slot>> {
        self.slots
            .get(vcpu_id)
            .ok_or(Error::InvalidVcpu(vcpu_id))?
            .lock()
            .map_err(|_| Error::PoisonedSlot)
    }

    fn signal_vcpu(&self, vcpu_id: usize) -> Result<()> {
        self.completions[vcpu_id].write(1).map_err(Error::EventFd)
    }
}

/// Hypervisor side of the channel.
pub struct IoReqChannel {
    shared: Arc<Shared>,
}

impl IoReqChannel {
    pub fn new(vcpus: usize) -> Result<Self> {
        let completions = (0..vcpus)
            .map(|_| EventFd::new(0).map_err(Error::EventFd))
            .collect::<Result<Vec<_>>>()?;

        Ok(IoReqChannel {
            shared: Arc::new(Shared {
                slots: (0..vcpus).map(|_| Mutex::new(Slot::default())).collect(),
                completions,
                notify: EventFd::new(0).map_err(Error::EventFd)?,
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// Handle for the device model.
    pub fn client(&self) -> IoReqClient {
        IoReqClient {
            shared: self.shared.clone(),
        }
    }

    /// Publishes `req` in the vCPU slot as pending and kicks the device model.
    pub fn insert(&self, vcpu_id: usize, req: &IoRequest) -> Result<()> {
        {
            let mut slot = self.shared.slot(vcpu_id)?;
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return Err(Error::Discarded(vcpu_id));
            }
            if slot.request.state != RequestState::Free {
                return Err(Error::SlotBusy(vcpu_id));
            }
            slot.request = *req;
            slot.request.state = RequestState::Pending;
            slot.discarded = false;
        }

        debug!("vCPU {} request forwarded to device model: {}", vcpu_id, req);
        self.shared.notify.write(1).map_err(Error::EventFd)
    }

    /// Blocks until the device model completed the vCPU request, then
    /// releases the slot and returns the completed request.
    pub fn wait_completion(&self, vcpu_id: usize) -> Result<IoRequest> {
        if vcpu_id >= self.shared.completions.len() {
            return Err(Error::InvalidVcpu(vcpu_id));
        }

        loop {
            {
                let mut slot = self.shared.slot(vcpu_id)?;
                if slot.discarded {
                    slot.discarded = false;
                    return Err(Error::Discarded(vcpu_id));
                }
                match slot.request.state {
                    RequestState::Completed => {
                        let done = slot.request;
                        slot.request.reset();
                        return Ok(done);
                    }
                    RequestState::Free => return Err(Error::NoOutstandingRequest(vcpu_id)),
                    RequestState::Pending | RequestState::Processing => {}
                }
            }

            self.shared.completions[vcpu_id]
                .read()
                .map_err(Error::EventFd)?;
        }
    }

    /// Drops every outstanding request and wakes their vCPUs. Completions
    /// arriving afterwards find a free slot and are rejected.
    pub fn shutdown(&self) -> Result<()> {
        self.shared.shutdown.store(true, Ordering::SeqCst);

        for vcpu_id in 0..self.shared.slots.len() {
            let mut slot = self.shared.slot(vcpu_id)?;
            if slot.request.state != RequestState::Free {
                warn!(
                    "Discarding vCPU {} request at shutdown: {}",
                    vcpu_id, slot.request
                );
                slot.request.reset();
                slot.discarded = true;
                drop(slot);
                self.shared.signal_vcpu(vcpu_id)?;
            }
        }

        // Let the device model notice the shutdown.
        self.shared.notify.write(1).map_err(Error::EventFd)
    }
}

/// Emulation backend of an external device model.
pub trait DeviceModel {
    /// Emulates `req` for `vcpu_id` and returns the value read, if any.
    fn emulate(&mut self, vcpu_id: usize, req: &IoRequest) -> u64;
}

/// Device model side of the channel.
#[derive(Clone)]
pub struct IoReqClient {
    shared: Arc<Shared>,
}

impl IoReqClient {
    /// Event signalled whenever a request is published or the VM shuts down.
    pub fn notifier(&self) -> &EventFd {
        &self.shared.notify
    }

    /// Blocks until the next notification.
    pub fn wait(&self) -> Result<()> {
        self.notifier().read().map(|_| ()).map_err(Error::EventFd)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    pub fn vcpus(&self) -> usize {
        self.shared.slots.len()
    }

    /// vCPUs whose slot holds a request not yet claimed.
    pub fn pending(&self) -> Result<Vec<usize>> {
        let mut ids = Vec::new();
        for vcpu_id in 0..self.vcpus() {
            if self.shared.slot(vcpu_id)?.request.state == RequestState::Pending {
                ids.push(vcpu_id);
            }
        }
        Ok(ids)
    }

    /// Takes ownership of a pending request.
    pub fn claim(&self, vcpu_id: usize) -> Result<IoRequest> {
        let mut slot = self.shared.slot(vcpu_id)?;
        if slot.request.state != RequestState::Pending {
            return Err(Error::NoOutstandingRequest(vcpu_id));
        }
        slot.request.state = RequestState::Processing;
        Ok(slot.request)
    }

    /// Reports the request done. `value` is stored for reads and ignored
    /// for writes.
    pub fn complete(&self, vcpu_id: usize, value: u64) -> Result<()> {
        {
            let mut slot = self.shared.slot(vcpu_id)?;
            match slot.request.state {
                RequestState::Pending | RequestState::Processing => {}
                _ => return Err(Error::NoOutstandingRequest(vcpu_id)),
            }
            if slot.request.is_read() {
                slot.request.set_value(value);
            }
            slot.request.state = RequestState::Completed;
            debug!("Device model completed vCPU {} request: {}", vcpu_id, slot.request);
        }

        self.shared.signal_vcpu(vcpu_id)
    }

    /// Serves requests with `model` until the VM shuts down.
    pub fn run<D: DeviceModel>(&self, model: &mut D) -> Result<()> {
        loop {
            self.wait()?;
            if self.is_shutdown() {
                debug!("Device model loop exiting");
                return Ok(());
            }

            for vcpu_id in self.pending()? {
                // Shutdown may race with us and drop the request.
                let req = match self.claim(vcpu_id) {
                    Ok(req) => req,
                    Err(Error::NoOutstandingRequest(_)) => continue,
                    Err(e) => return Err(e),
                };
                let value = model.emulate(vcpu_id, &req);
                match self.complete(vcpu_id, value) {
                    Ok(()) | Err(Error::NoOutstandingRequest(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }
}
