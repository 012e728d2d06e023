// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate log;

use std::collections::HashMap;
use std::fs;
use std::process;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context};
use clap::{Arg, ArgMatches, Command};
use devices::legacy::Cmos;
use devices::ScratchRegisters;
use hypervisor::{EmulatorCpuState, IoExitQualification, StandardRegisters, VmExit};
use serde::Deserialize;
use vm_device::{IoRequest, IoRequestKind, PioIndex};
use vmm::{DeviceModel, Vcpu, Vm, VmConfig};

#[derive(Debug, Default, Deserialize)]
struct ScratchConfig {
    base: u64,
    size: usize,
}

#[derive(Debug, Default, Deserialize)]
struct DevicesConfig {
    #[serde(default)]
    cmos: bool,
    #[serde(default)]
    scratch: Vec<ScratchConfig>,
}

fn default_pio_instruction_len() -> u32 {
    1
}

/// One trapped guest access.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Access {
    In {
        port: u16,
        size: u8,
        #[serde(default = "default_pio_instruction_len")]
        len: u32,
    },
    Out {
        port: u16,
        size: u8,
        value: u64,
        #[serde(default = "default_pio_instruction_len")]
        len: u32,
    },
    Mmio {
        gpa: u64,
        insn: Vec<u8>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct VcpuTrace {
    #[serde(default)]
    regs: StandardRegisters,
    #[serde(default)]
    accesses: Vec<Access>,
}

#[derive(Debug, Default, Deserialize)]
struct Trace {
    #[serde(default)]
    vm: VmConfig,
    #[serde(default)]
    devices: DevicesConfig,
    #[serde(default)]
    vcpus: Vec<VcpuTrace>,
}

/// In-process stand-in for the user-space device model: every unclaimed
/// location behaves like a plain register, floating high until written.
#[derive(Default)]
struct LatchDeviceModel {
    latched: HashMap<(IoRequestKind, u64), u64>,
}

impl DeviceModel for LatchDeviceModel {
    fn emulate(&mut self, vcpu_id: usize, req: &IoRequest) -> u64 {
        info!("Device model handling vCPU {} request: {}", vcpu_id, req);
        let key = (req.kind, req.address);
        if req.is_read() {
            self.latched.get(&key).copied().unwrap_or(u64::MAX)
        } else {
            self.latched.insert(key, req.value);
            0
        }
    }
}

struct VcpuReport {
    id: usize,
    results: Vec<String>,
    regs: StandardRegisters,
}

fn run_vcpu(mut vcpu: Vcpu, accesses: Vec<Access>) -> VcpuReport {
    let mut results = Vec::with_capacity(accesses.len());

    for access in accesses.iter() {
        if let Access::Out { value, .. } = access {
            vcpu.state_mut().regs.rax = *value;
        }
        let exit = match access {
            Access::In { port, size, len } => VmExit::IoInstruction {
                qualification: IoExitQualification::new(*port, *size, true),
                instruction_len: *len,
            },
            Access::Out {
                port, size, len, ..
            } => VmExit::IoInstruction {
                qualification: IoExitQualification::new(*port, *size, false),
                instruction_len: *len,
            },
            Access::Mmio { gpa, insn } => VmExit::MmioAccess { gpa: *gpa, insn },
        };

        let result = match vcpu.handle_exit(&exit) {
            Ok(outcome) => format!(
                "{:?} -> {:?} (rax {:#x})",
                access,
                outcome,
                vcpu.state().regs.rax
            ),
            Err(vmm::cpu::Error::VmShuttingDown) => {
                results.push(format!("{:?} -> VM shutting down", access));
                break;
            }
            Err(e) => {
                warn!("vCPU {} failed to emulate {:?}: {}", vcpu.id(), access, e);
                format!("{:?} -> error: {}", access, e)
            }
        };
        results.push(result);
    }

    VcpuReport {
        id: vcpu.id(),
        results,
        regs: vcpu.state().regs,
    }
}

fn attach_devices(vm: &Vm, devices: &DevicesConfig) -> anyhow::Result<()> {
    if devices.cmos {
        vm.register_pio_handler(PioIndex::Rtc, Cmos::range(), Arc::new(Cmos::new(0, 0, None)))
            .context("Failed registering the CMOS device")?;
    }

    for scratch in devices.scratch.iter() {
        let dev = Arc::new(ScratchRegisters::new(scratch.base, scratch.size));
        let (start, end) = (dev.base(), dev.end());
        vm.register_mmio_handler(dev, start, end)
            .with_context(|| format!("Failed registering scratch registers at {start:#x}"))?;
    }

    Ok(())
}

fn start_io_emul(cmd_arguments: &ArgMatches) -> anyhow::Result<()> {
    let trace_path = cmd_arguments
        .get_one::<String>("trace")
        .ok_or_else(|| anyhow!("Missing argument: trace"))?;
    let trace = fs::read_to_string(trace_path)
        .with_context(|| format!("Failed reading trace file {trace_path}"))?;
    let mut trace: Trace = serde_json::from_str(&trace).context("Failed parsing trace file")?;

    if let Some(vcpus) = cmd_arguments.get_one::<usize>("vcpus") {
        trace.vm.vcpus = *vcpus;
    }
    if trace.vcpus.len() > trace.vm.vcpus {
        return Err(anyhow!(
            "Trace has {} vCPUs, VM is configured with {}",
            trace.vcpus.len(),
            trace.vm.vcpus
        ));
    }

    let vm = Arc::new(Vm::new(trace.vm).context("Failed creating the VM")?);
    attach_devices(&vm, &trace.devices)?;
    vm.launch().context("Failed launching the VM")?;

    let device_model = match vm.device_model_client() {
        Some(client) => Some(
            thread::Builder::new()
                .name("device_model".to_string())
                .spawn(move || client.run(&mut LatchDeviceModel::default()))
                .context("Failed spawning the device model thread")?,
        ),
        None => None,
    };

    let mut vcpu_threads = Vec::new();
    for (id, vcpu_trace) in trace.vcpus.into_iter().enumerate() {
        let mut state = EmulatorCpuState::long_mode();
        state.regs = vcpu_trace.regs;
        let vcpu = Vcpu::new(id, vm.clone(), state)?;
        let accesses = vcpu_trace.accesses;
        vcpu_threads.push(
            thread::Builder::new()
                .name(format!("vcpu{id}"))
                .spawn(move || run_vcpu(vcpu, accesses))
                .context("Failed spawning a vCPU thread")?,
        );
    }

    let mut reports = Vec::new();
    for handle in vcpu_threads {
        reports.push(
            handle
                .join()
                .map_err(|_| anyhow!("vCPU thread panicked"))?,
        );
    }

    vm.shutdown().context("Failed shutting the VM down")?;
    if let Some(handle) = device_model {
        handle
            .join()
            .map_err(|_| anyhow!("Device model thread panicked"))?
            .context("Device model failed")?;
    }

    for report in reports {
        for result in report.results.iter() {
            println!("vcpu{}: {}", report.id, result);
        }
        println!(
            "vcpu{} registers: {}",
            report.id,
            serde_json::to_string(&report.regs)?
        );
    }

    Ok(())
}

fn main() {
    let cmd_arguments = Command::new("io-emul")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Replay trapped guest I/O accesses through the emulation path.")
        .arg_required_else_help(true)
        .arg(
            Arg::new("trace")
                .long("trace")
                .help("JSON file describing the VM, its devices and the vCPU accesses")
                .num_args(1)
                .required(true),
        )
        .arg(
            Arg::new("vcpus")
                .long("vcpus")
                .help("Number of vCPUs, overriding the trace file")
                .num_args(1)
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .help("Log level: error, warn, info, debug or trace")
                .num_args(1)
                .default_value("warn"),
        )
        .get_matches();

    let log_level = cmd_arguments
        .get_one::<String>("log-level")
        .map(|s| s.as_str())
        .unwrap_or("warn");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    if let Err(e) = start_io_emul(&cmd_arguments) {
        eprintln!("Error: {e:?}");
        process::exit(1);
    }
}
