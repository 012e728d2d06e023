// Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::cmp::min;
use std::mem;
use std::sync::Mutex;

// https://github.com/rust-lang/libc/issues/1848
#[cfg_attr(target_env = "musl", allow(deprecated))]
use libc::time_t;
use libc::{clock_gettime, gmtime_r, timespec, tm, CLOCK_REALTIME};
use vm_device::{BusRange, HandlerError, HandlerResult, PioHandler};
use vmm_sys_util::eventfd::EventFd;

/// First port of the CMOS index/data pair.
pub const CMOS_PORT_BASE: u16 = 0x70;
/// Number of ports decoded by the device.
pub const CMOS_PORT_LEN: u64 = 2;

const INDEX_MASK: u8 = 0x7f;
const INDEX_OFFSET: u16 = 0x0;
const DATA_OFFSET: u16 = 0x1;
const DATA_LEN: usize = 128;

struct CmosRegisters {
    index: u8,
    data: [u8; DATA_LEN],
}

/// A CMOS/RTC device commonly seen on x86 I/O port 0x70/0x71.
///
/// Registered in the RTC slot of the port I/O table. Several vCPUs may
/// poke the index/data pair concurrently, so the register file sits
/// behind a mutex.
pub struct Cmos {
    regs: Mutex<CmosRegisters>,
    reset_evt: Option<EventFd>,
}

impl Cmos {
    /// Constructs a CMOS/RTC device with initial data.
    /// `mem_below_4g` is the size of memory in bytes below the 32-bit gap.
    /// `mem_above_4g` is the size of memory in bytes above the 32-bit gap.
    pub fn new(mem_below_4g: u64, mem_above_4g: u64, reset_evt: Option<EventFd>) -> Cmos {
        let mut data = [0u8; DATA_LEN];

        // Extended memory from 16 MB to 4 GB in units of 64 KB
        let ext_mem = min(
            0xFFFF,
            mem_below_4g.saturating_sub(16 * 1024 * 1024) / (64 * 1024),
        );
        data[0x34] = ext_mem as u8;
        data[0x35] = (ext_mem >> 8) as u8;

        // High memory (> 4GB) in units of 64 KB
        let high_mem = min(0x00FF_FFFF, mem_above_4g / (64 * 1024));
        data[0x5b] = high_mem as u8;
        data[0x5c] = (high_mem >> 8) as u8;
        data[0x5d] = (high_mem >> 16) as u8;

        Cmos {
            regs: Mutex::new(CmosRegisters { index: 0, data }),
            reset_evt,
        }
    }

    /// Ports claimed by the device.
    pub fn range() -> BusRange {
        BusRange {
            base: u64::from(CMOS_PORT_BASE),
            len: CMOS_PORT_LEN,
        }
    }

    fn offset(port: u16, size: u8) -> HandlerResult<u16> {
        if size != 1 {
            warn!("Invalid access size on CMOS device: {}", size);
            return Err(HandlerError::InvalidAccessSize {
                address: u64::from(port),
                size,
            });
        }
        Ok(port.wrapping_sub(CMOS_PORT_BASE))
    }

    fn regs(&self) -> HandlerResult<std::sync::MutexGuard<'_, CmosRegisters>> {
        self.regs
            .lock()
            .map_err(|_| HandlerError::Device("CMOS register lock poisoned".to_string()))
    }
}

fn to_bcd(v: u8) -> u8 {
    ((v / 10) << 4) | (v % 10)
}

struct WallClock {
    seconds: i32,
    minutes: i32,
    hours: i32,
    week_day: i32,
    day: i32,
    month: i32,
    year: i32,
    update_in_progress: bool,
}

fn wall_clock() -> WallClock {
    // SAFETY: The clock_gettime and gmtime_r calls are safe as long as the structs they are
    // given are large enough, and neither of them fail. It is safe to zero initialize
    // the tm and timespec struct because it contains only plain data.
    unsafe {
        let mut timespec: timespec = mem::zeroed();
        clock_gettime(CLOCK_REALTIME, &mut timespec as *mut _);

        // https://github.com/rust-lang/libc/issues/1848
        #[cfg_attr(target_env = "musl", allow(deprecated))]
        let now: time_t = timespec.tv_sec;
        let mut tm: tm = mem::zeroed();
        gmtime_r(&now, &mut tm as *mut _);

        // Update in Progress bit held for last 224us of each second
        const NANOSECONDS_PER_SECOND: i64 = 1_000_000_000;
        const UIP_HOLD_LENGTH: i64 = 8 * NANOSECONDS_PER_SECOND / 32768;

        WallClock {
            seconds: tm.tm_sec,
            minutes: tm.tm_min,
            hours: tm.tm_hour,
            week_day: tm.tm_wday + 1,
            day: tm.tm_mday,
            month: tm.tm_mon + 1,
            year: tm.tm_year,
            update_in_progress: timespec.tv_nsec as i64
                >= (NANOSECONDS_PER_SECOND - UIP_HOLD_LENGTH),
        }
    }
}

impl PioHandler for Cmos {
    fn pio_read(&self, port: u16, size: u8) -> HandlerResult<u32> {
        let offset = Cmos::offset(port, size)?;
        let regs = self.regs()?;

        let value = match offset {
            INDEX_OFFSET => regs.index,
            DATA_OFFSET => {
                let index = regs.index & INDEX_MASK;
                match index {
                    0x00 | 0x02 | 0x04 | 0x06 | 0x07 | 0x08 | 0x09 | 0x0a | 0x32 => {
                        let clock = wall_clock();
                        match index {
                            0x00 => to_bcd(clock.seconds as u8),
                            0x02 => to_bcd(clock.minutes as u8),
                            0x04 => to_bcd(clock.hours as u8),
                            0x06 => to_bcd(clock.week_day as u8),
                            0x07 => to_bcd(clock.day as u8),
                            0x08 => to_bcd(clock.month as u8),
                            0x09 => to_bcd((clock.year % 100) as u8),
                            // Bit 5 for 32kHz clock. Bit 7 for Update in Progress
                            0x0a => (1 << 5) | ((clock.update_in_progress as u8) << 7),
                            _ => to_bcd(((clock.year + 1900) / 100) as u8),
                        }
                    }
                    // Bit 0-6 are reserved and must be 0.
                    // Bit 7 must be 1 (CMOS has power)
                    0x0d => 1 << 7,
                    i => regs.data[usize::from(i)],
                }
            }
            o => {
                warn!("bad read offset on CMOS device: {}", o);
                return Err(HandlerError::InvalidRegister(u64::from(port)));
            }
        };

        Ok(u32::from(value))
    }

    fn pio_write(&self, port: u16, size: u8, value: u32) -> HandlerResult<()> {
        let offset = Cmos::offset(port, size)?;
        let byte = value as u8;
        let mut regs = self.regs()?;

        match offset {
            INDEX_OFFSET => regs.index = byte,
            DATA_OFFSET => {
                if regs.index == 0x8f && byte == 0 {
                    info!("CMOS reset");
                    if let Some(reset_evt) = &self.reset_evt {
                        reset_evt
                            .write(1)
                            .map_err(|e| HandlerError::Device(format!("CMOS reset: {e}")))?;
                    }
                } else {
                    let index = regs.index & INDEX_MASK;
                    regs.data[usize::from(index)] = byte;
                }
            }
            o => {
                warn!("bad write offset on CMOS device: {}", o);
                return Err(HandlerError::InvalidRegister(u64::from(port)));
            }
        }
        Ok(())
    }
}
