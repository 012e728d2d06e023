// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

//! Per-VM port passthrough permissions.

use std::sync::atomic::{AtomicU64, Ordering};

/// Number of ports in the x86 I/O space.
pub const PIO_SPACE_SIZE: u32 = 0x1_0000;

/// Size of each of the two VMX I/O bitmaps.
pub const VMX_IO_BITMAP_SIZE: usize = 4096;

const BITS_PER_WORD: u32 = u64::BITS;
const WORDS: usize = (PIO_SPACE_SIZE / BITS_PER_WORD) as usize;

/// One bit per port. A set bit lets the guest access the port directly.
///
/// Words are atomic so grants may be changed while vCPUs are running.
pub struct PortBitmap {
    words: Box<[AtomicU64]>,
}

impl Default for PortBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl PortBitmap {
    /// All ports trapped.
    pub fn new() -> Self {
        PortBitmap {
            words: (0..WORDS).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn locate(port: u32) -> (usize, u64) {
        ((port / BITS_PER_WORD) as usize, 1u64 << (port % BITS_PER_WORD))
    }

    // Ports beyond the I/O space are dropped.
    fn ports(port: u16, nbytes: u32) -> std::ops::Range<u32> {
        let start = u32::from(port);
        start..start.saturating_add(nbytes).min(PIO_SPACE_SIZE)
    }

    /// Lets the guest access `[port, port + nbytes)` directly.
    pub fn allow(&self, port: u16, nbytes: u32) {
        for p in Self::ports(port, nbytes) {
            let (word, bit) = Self::locate(p);
            self.words[word].fetch_or(bit, Ordering::SeqCst);
        }
    }

    /// Traps `[port, port + nbytes)` again.
    pub fn deny(&self, port: u16, nbytes: u32) {
        for p in Self::ports(port, nbytes) {
            let (word, bit) = Self::locate(p);
            self.words[word].fetch_and(!bit, Ordering::SeqCst);
        }
    }

    pub fn is_passthrough(&self, port: u16) -> bool {
        let (word, bit) = Self::locate(u32::from(port));
        self.words[word].load(Ordering::SeqCst) & bit != 0
    }

    /// True if every byte of `[port, port + size)` is passed through.
    pub fn covers(&self, port: u64, size: u64) -> bool {
        if size == 0 {
            return false;
        }
        match port.checked_add(size) {
            Some(end) if end <= u64::from(PIO_SPACE_SIZE) => {
                (port..end).all(|p| self.is_passthrough(p as u16))
            }
            _ => false,
        }
    }

    /// Builds the VMX I/O bitmaps A (ports 0x0000-0x7fff) and B
    /// (0x8000-0xffff), where a set bit requests a VM exit.
    pub fn vmx_io_bitmaps(&self) -> ([u8; VMX_IO_BITMAP_SIZE], [u8; VMX_IO_BITMAP_SIZE]) {
        let mut bitmaps = [[0xffu8; VMX_IO_BITMAP_SIZE]; 2];
        for (i, word) in self.words.iter().enumerate() {
            let allowed = word.load(Ordering::SeqCst).to_le_bytes();
            for (j, byte) in allowed.iter().enumerate() {
                let offset = i * 8 + j;
                bitmaps[offset / VMX_IO_BITMAP_SIZE][offset % VMX_IO_BITMAP_SIZE] = !byte;
            }
        }
        let [a, b] = bitmaps;
        (a, b)
    }
}
