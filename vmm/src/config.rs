// Copyright © 2022 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vm_device::bitmap::PIO_SPACE_SIZE;

/// Errors associated with VM configuration parameters.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// No vCPUs configured
    #[error("No vCPUs configured")]
    NoVcpus,
    /// No room for emulated MMIO ranges
    #[error("Emulated MMIO region count must be non-zero")]
    NoMmioRegions,
    /// Passthrough range outside the port space
    #[error("Passthrough port range {0:#x}+{1:#x} is outside the port space")]
    InvalidPassthroughRange(u16, u32),
}

type ValidationResult<T> = std::result::Result<T, ValidationError>;

/// When and by whom a VM is started.
///
/// Only post-launched VMs have an external device model. Accesses that no
/// internal handler claims cannot be forwarded anywhere for the other two.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadOrder {
    PreLaunched,
    ServiceVm,
    #[default]
    PostLaunched,
}

impl LoadOrder {
    pub fn has_device_model(&self) -> bool {
        *self == LoadOrder::PostLaunched
    }
}

/// Ports handed directly to the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PassthroughPioConfig {
    pub base: u16,
    pub len: u32,
}

pub const DEFAULT_VCPUS: usize = 1;
pub fn default_vmconfig_vcpus() -> usize {
    DEFAULT_VCPUS
}

pub const DEFAULT_MAX_EMULATED_MMIO_REGIONS: usize = 16;
pub fn default_vmconfig_max_emulated_mmio_regions() -> usize {
    DEFAULT_MAX_EMULATED_MMIO_REGIONS
}

pub const DEFAULT_VM_NAME: &str = "vm0";
pub fn default_vmconfig_name() -> String {
    DEFAULT_VM_NAME.to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct VmConfig {
    #[serde(default = "default_vmconfig_name")]
    pub name: String,
    #[serde(default = "default_vmconfig_vcpus")]
    pub vcpus: usize,
    #[serde(default)]
    pub load_order: LoadOrder,
    #[serde(default = "default_vmconfig_max_emulated_mmio_regions")]
    pub max_emulated_mmio_regions: usize,
    #[serde(default)]
    pub passthrough_pio: Vec<PassthroughPioConfig>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            name: default_vmconfig_name(),
            vcpus: DEFAULT_VCPUS,
            load_order: LoadOrder::default(),
            max_emulated_mmio_regions: DEFAULT_MAX_EMULATED_MMIO_REGIONS,
            passthrough_pio: Vec::new(),
        }
    }
}

impl VmConfig {
    pub fn validate(&self) -> ValidationResult<()> {
        if self.vcpus == 0 {
            return Err(ValidationError::NoVcpus);
        }

        if self.max_emulated_mmio_regions == 0 {
            return Err(ValidationError::NoMmioRegions);
        }

        for range in self.passthrough_pio.iter() {
            let end = u32::from(range.base).checked_add(range.len);
            if end.map_or(true, |end| end > PIO_SPACE_SIZE) {
                return Err(ValidationError::InvalidPassthroughRange(
                    range.base, range.len,
                ));
            }
        }

        Ok(())
    }
}
