// Copyright 2026, Red Hat Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Glue between the virtio-blk device model and the file-backed disk.

use std::io;

use devices::virtio::block::{DequeueError, InitError, VirtioBlk};
use devices::virtio::{VirtQueue, VirtioDevice};
use vhost::VhostUserDevice;

use crate::disk::DiskProperties;

/// The vhost-user block device: a virtio-blk model fed by guest kicks and
/// completed synchronously against a disk image.
pub struct VhostBlk {
    vblk: VirtioBlk,
    disk: DiskProperties,
}

impl VhostBlk {
    pub fn new(disk: DiskProperties, block_size: u32) -> Result<VhostBlk, InitError> {
        let vblk = VirtioBlk::new(
            disk.nsectors(),
            block_size,
            disk.is_read_only(),
            disk.is_writeback(),
        )?;
        Ok(VhostBlk { vblk, disk })
    }
}

impl VirtioDevice for VhostBlk {
    fn device_type(&self) -> u32 {
        self.vblk.device_type()
    }

    fn avail_features(&self) -> u64 {
        self.vblk.avail_features()
    }

    fn acked_features(&self) -> u64 {
        self.vblk.acked_features()
    }

    fn set_acked_features(&mut self, acked_features: u64) {
        self.vblk.set_acked_features(acked_features)
    }

    fn config_size(&self) -> usize {
        self.vblk.config_size()
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        self.vblk.read_config(offset, data)
    }
}

impl VhostUserDevice for VhostBlk {
    fn handle_vring(&mut self, vq: &mut VirtQueue) -> io::Result<()> {
        loop {
            match self.vblk.dequeue_request(vq) {
                Ok(bio) => {
                    let status = self.disk.execute(&bio);
                    self.vblk.complete_request(vq, bio, status);
                }
                // Malformed request: already consumed, keep draining.
                Err(DequeueError::InvalidRequest) => continue,
                // Nothing left, or the ring broke and will produce nothing
                // until the master reinitializes it.
                Err(DequeueError::Empty) | Err(DequeueError::QueueBroken) => break,
            }
        }
        Ok(())
    }
}
