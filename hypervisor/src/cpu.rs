// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//

use crate::arch::x86::vmx::IoExitQualification;

#[derive(Debug)]
pub enum VmExit<'a> {
    /// `in`/`out` trapped by the I/O bitmap.
    IoInstruction {
        qualification: IoExitQualification,
        /// VM-exit instruction length.
        instruction_len: u32,
    },
    /// EPT violation on an emulated MMIO range.
    MmioAccess {
        gpa: u64,
        /// Bytes fetched at the guest IP.
        insn: &'a [u8],
    },
}
