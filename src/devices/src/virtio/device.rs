// Copyright 2026, Red Hat Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Generic virtio device surface.

/// Block device type id, virtio 1.0 chapter 5.
pub const TYPE_BLOCK: u32 = 2;

/// The capability set every virtio device type exposes to a transport.
///
/// The control plane holds devices through this trait only; it never
/// inspects the concrete device kind.
pub trait VirtioDevice {
    /// The virtio device type id.
    fn device_type(&self) -> u32;

    /// Feature bits this device can advertise to the driver.
    fn avail_features(&self) -> u64;

    /// Feature bits negotiated with the driver.
    fn acked_features(&self) -> u64;

    fn set_acked_features(&mut self, acked_features: u64);

    /// Size of the device configuration space in bytes.
    fn config_size(&self) -> usize;

    /// Copy config space content starting at `offset` into `data`. Reads
    /// past the end of config space leave the tail of `data` untouched.
    fn read_config(&self, offset: u64, data: &mut [u8]);
}
