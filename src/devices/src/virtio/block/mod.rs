// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod device;

pub use self::device::{
    BlkIoRequest, BlkIoStatus, DequeueError, InitError, IoKind, IoVec, RequestHeader, VirtioBlk,
};

pub const SECTOR_SHIFT: u8 = 9;
pub const SECTOR_SIZE: u64 = (0x01_u64) << SECTOR_SHIFT;
