// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.

//! Emulates virtual devices reached through the I/O handler registries.

#[macro_use]
extern crate log;

pub mod legacy;
pub mod scratch;

pub use self::scratch::ScratchRegisters;
