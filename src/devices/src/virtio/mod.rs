// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Implements virtio guest-memory plumbing and device models: the guest
//! memory map, the split virtqueue engine and the virtio-blk device.

pub mod block;
mod device;
pub mod memory;
pub mod queue;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use self::device::{VirtioDevice, TYPE_BLOCK};
pub use self::memory::{GuestMapping, MemoryMap, MemoryRegion};
pub use self::queue::{Buffer, DescriptorChain, VirtQueue};
