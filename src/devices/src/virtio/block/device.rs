// Copyright 2026, Red Hat Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.

//! Virtio-blk device model: request parsing and completion.
//!
//! This layer turns one descriptor chain into one validated block request
//! ({header, data buffers, status byte}) and later commits the completion.
//! The storage backend owns the request in between. Malformed chains are
//! consumed silently: the used element is published with zero bytes written
//! and no status byte is touched, so the guest cannot confuse garbage input
//! with a completed request.

use std::mem;
use std::ptr;

use virtio_bindings::virtio_blk::{
    VIRTIO_BLK_F_BLK_SIZE, VIRTIO_BLK_F_FLUSH, VIRTIO_BLK_F_RO, VIRTIO_BLK_S_IOERR,
    VIRTIO_BLK_S_OK, VIRTIO_BLK_T_FLUSH, VIRTIO_BLK_T_GET_ID, VIRTIO_BLK_T_IN, VIRTIO_BLK_T_OUT,
};
use virtio_bindings::virtio_config::VIRTIO_F_VERSION_1;
use virtio_bindings::virtio_ring::VIRTIO_RING_F_INDIRECT_DESC;
use vm_memory::ByteValued;

use super::{SECTOR_SHIFT, SECTOR_SIZE};
use crate::virtio::queue::{DescriptorChain, VirtQueue};
use crate::virtio::{VirtioDevice, TYPE_BLOCK};

/// The request header represents the mandatory fields of each block device
/// request.
///
/// A request header contains the following fields:
///   * request_type: an u32 value mapping to a read, write or flush operation.
///   * reserved: 32 bits are reserved for future extensions of the Virtio Spec.
///   * sector: an u64 value representing the offset where a read/write is to occur.
///
/// The header simplifies reading the request from memory as all request follow
/// the same memory layout.
#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct RequestHeader {
    request_type: u32,
    _reserved: u32,
    sector: u64,
}

// Safe because RequestHeader only contains plain data.
unsafe impl ByteValued for RequestHeader {}

impl RequestHeader {
    pub fn new(request_type: u32, sector: u64) -> RequestHeader {
        RequestHeader {
            request_type,
            _reserved: 0,
            sector,
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C, packed)]
struct VirtioBlkConfig {
    capacity: u64,
    size_max: u32,
    seg_max: u32,
    cylinders: u16,
    heads: u8,
    sectors: u8,
    blk_size: u32,
}

// Safe because it only has data and has no implicit padding.
unsafe impl ByteValued for VirtioBlkConfig {}

#[derive(Debug)]
pub enum InitError {
    /// Block size is zero or not a multiple of the 512-byte sector.
    InvalidBlockSize(u32),
    /// Device capacity is zero.
    InvalidCapacity,
}

impl std::fmt::Display for InitError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use self::InitError::*;

        match self {
            InvalidBlockSize(size) => write!(f, "invalid block size {size}"),
            InvalidCapacity => write!(f, "device capacity must not be zero"),
        }
    }
}

impl std::error::Error for InitError {}

#[derive(Debug)]
pub enum DequeueError {
    /// The avail ring holds no new request.
    Empty,
    /// The queue was broken by earlier malformed ring data.
    QueueBroken,
    /// The chain was malformed; it has been consumed without a status write.
    InvalidRequest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
    Flush,
    GetId,
}

/// Completion status reported back to the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BlkIoStatus {
    Ok = VIRTIO_BLK_S_OK as u8,
    IoError = VIRTIO_BLK_S_IOERR as u8,
}

/// One element of a request's scatter-gather list, resolved to host memory.
#[derive(Clone, Copy, Debug)]
pub struct IoVec {
    pub ptr: *mut u8,
    pub len: usize,
}

/// An in-flight block request.
///
/// Produced by [`VirtioBlk::dequeue_request`] and owned by the storage
/// backend until it is handed back through [`VirtioBlk::complete_request`].
#[derive(Debug)]
pub struct BlkIoRequest {
    pub kind: IoKind,

    /// Start sector; meaningful for reads and writes only.
    pub sector: u64,

    /// Total data sectors covered by `iovecs`.
    pub total_sectors: u32,

    /// Data buffers in chain order.
    pub iovecs: Vec<IoVec>,

    // Completion context: the chain head to publish, where the status byte
    // goes, and the queue incarnation the pointers belong to.
    head: u16,
    status_ptr: *mut u8,
    epoch: u64,
}

/// Virtio-blk emulated device model.
pub struct VirtioBlk {
    total_sectors: u64,
    block_size: u32,
    readonly: bool,
    writeback: bool,

    avail_features: u64,
    acked_features: u64,
    config: VirtioBlkConfig,
}

impl VirtioBlk {
    pub fn new(
        total_sectors: u64,
        block_size: u32,
        readonly: bool,
        writeback: bool,
    ) -> Result<VirtioBlk, InitError> {
        if block_size == 0 || block_size % SECTOR_SIZE as u32 != 0 {
            return Err(InitError::InvalidBlockSize(block_size));
        }
        if total_sectors == 0 {
            return Err(InitError::InvalidCapacity);
        }

        let mut avail_features = (1u64 << VIRTIO_F_VERSION_1)
            | (1u64 << VIRTIO_RING_F_INDIRECT_DESC)
            | (1u64 << VIRTIO_BLK_F_BLK_SIZE);

        if readonly {
            avail_features |= 1u64 << VIRTIO_BLK_F_RO;
        }

        // 5.2.5.1 Driver Requirements: Device Initialization: if
        // VIRTIO_BLK_F_FLUSH was negotiated the driver assumes a writeback
        // cache, so only expose it when the backend actually caches.
        if writeback {
            avail_features |= 1u64 << VIRTIO_BLK_F_FLUSH;
        }

        let config = VirtioBlkConfig {
            capacity: total_sectors,
            blk_size: block_size,
            ..Default::default()
        };

        Ok(VirtioBlk {
            total_sectors,
            block_size,
            readonly,
            writeback,
            avail_features,
            acked_features: 0,
            config,
        })
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn is_read_only(&self) -> bool {
        self.readonly
    }

    pub fn is_writeback(&self) -> bool {
        self.writeback
    }

    /// Pull the next request off the queue.
    ///
    /// A malformed chain is consumed on the spot: its used element is
    /// published with zero bytes written and no status byte is touched.
    pub fn dequeue_request(&self, vq: &mut VirtQueue) -> Result<BlkIoRequest, DequeueError> {
        if vq.is_broken() {
            return Err(DequeueError::QueueBroken);
        }

        let mut chain = match vq.pop_avail() {
            Some(chain) => chain,
            None => return Err(DequeueError::Empty),
        };

        match self.parse_request(&mut chain) {
            Some(bio) => Ok(bio),
            None => {
                chain.release(0);
                Err(DequeueError::InvalidRequest)
            }
        }
    }

    /// Write the status byte and publish the used element for `bio`.
    ///
    /// Completions arriving after the ring was reset, restarted or broken
    /// are dropped: the request's pointers belong to a queue incarnation
    /// that no longer exists.
    pub fn complete_request(&self, vq: &mut VirtQueue, bio: BlkIoRequest, status: BlkIoStatus) {
        if !vq.is_ready() || vq.is_broken() || bio.epoch != vq.epoch() {
            return;
        }

        // Status first, then the used element; the driver must never observe
        // a published chain whose status byte is still stale.
        // SAFETY: the pointer was validated as a writable one-byte mapping at
        // parse time, and the epoch check above pins the same incarnation.
        unsafe { ptr::write_volatile(bio.status_ptr, status as u8) };

        vq.enqueue_used(bio.head, 0);
        vq.signal_used();
    }

    fn parse_request(&self, chain: &mut DescriptorChain) -> Option<BlkIoRequest> {
        // First buffer carries the request header.
        let hdr_buf = chain.next_buffer()?;
        if hdr_buf.len as usize != mem::size_of::<RequestHeader>() || !hdr_buf.ro {
            return None;
        }

        // Copy the header out of shared memory before looking at it, so the
        // guest cannot flip fields after validation.
        let mut hdr = RequestHeader::default();
        // SAFETY: ptr/len were validated by the queue against the memory map.
        unsafe {
            ptr::copy_nonoverlapping(
                hdr_buf.ptr,
                hdr.as_mut_slice().as_mut_ptr(),
                mem::size_of::<RequestHeader>(),
            )
        };

        match hdr.request_type {
            VIRTIO_BLK_T_IN => self.parse_rw(&hdr, chain, IoKind::Read),
            VIRTIO_BLK_T_OUT => {
                if self.readonly {
                    return None;
                }
                self.parse_rw(&hdr, chain, IoKind::Write)
            }
            VIRTIO_BLK_T_FLUSH => self.parse_flush(chain),
            VIRTIO_BLK_T_GET_ID => self.parse_get_id(chain),
            // Unknown request types are dropped without a status write.
            _ => None,
        }
    }

    fn parse_rw(
        &self,
        hdr: &RequestHeader,
        chain: &mut DescriptorChain,
        kind: IoKind,
    ) -> Option<BlkIoRequest> {
        let sector = hdr.sector;
        if sector >= self.total_sectors {
            return None;
        }

        // Walk the chain expecting a series of data buffers (at least one)
        // terminated by a one-byte writable status buffer.
        let mut iovecs = Vec::new();
        let mut total_sectors: u64 = 0;
        let mut status_ptr = None;

        while let Some(buf) = chain.next_buffer() {
            if !chain.has_next() {
                // The last buffer is the status byte.
                if buf.len != 1 || buf.ro {
                    return None;
                }
                status_ptr = Some(buf.ptr);
                break;
            }

            // Data buffers are whole sectors, directed according to the
            // request: the device writes read data and reads write data.
            if buf.len % SECTOR_SIZE as u32 != 0 {
                return None;
            }
            match kind {
                IoKind::Read => {
                    if buf.ro {
                        return None;
                    }
                }
                _ => {
                    if !buf.ro {
                        return None;
                    }
                }
            }

            total_sectors += u64::from(buf.len >> SECTOR_SHIFT);
            if sector.checked_add(total_sectors)? > self.total_sectors {
                return None;
            }

            iovecs.push(IoVec {
                ptr: buf.ptr,
                len: buf.len as usize,
            });
        }

        // Missing data buffers, missing status, or a chain that broke the
        // queue mid-walk all fail the request.
        let status_ptr = status_ptr?;
        if iovecs.is_empty() {
            return None;
        }

        Some(BlkIoRequest {
            kind,
            sector,
            total_sectors: u32::try_from(total_sectors).ok()?,
            iovecs,
            head: chain.head(),
            status_ptr,
            epoch: chain.epoch(),
        })
    }

    fn parse_flush(&self, chain: &mut DescriptorChain) -> Option<BlkIoRequest> {
        // A flush is just {header, status}; data buffers are not allowed.
        let buf = chain.next_buffer()?;
        if chain.has_next() || buf.len != 1 || buf.ro {
            return None;
        }

        Some(BlkIoRequest {
            kind: IoKind::Flush,
            sector: 0,
            total_sectors: 0,
            iovecs: Vec::new(),
            head: chain.head(),
            status_ptr: buf.ptr,
            epoch: chain.epoch(),
        })
    }

    fn parse_get_id(&self, chain: &mut DescriptorChain) -> Option<BlkIoRequest> {
        // {header, id buffer, status}; the id buffer is written by the
        // device and is not sector-sized.
        let data = chain.next_buffer()?;
        if !chain.has_next() || data.ro {
            return None;
        }

        let status = chain.next_buffer()?;
        if chain.has_next() || status.len != 1 || status.ro {
            return None;
        }

        Some(BlkIoRequest {
            kind: IoKind::GetId,
            sector: 0,
            total_sectors: 0,
            iovecs: vec![IoVec {
                ptr: data.ptr,
                len: data.len as usize,
            }],
            head: chain.head(),
            status_ptr: status.ptr,
            epoch: chain.epoch(),
        })
    }
}

impl VirtioDevice for VirtioBlk {
    fn device_type(&self) -> u32 {
        TYPE_BLOCK
    }

    fn avail_features(&self) -> u64 {
        self.avail_features
    }

    fn acked_features(&self) -> u64 {
        self.acked_features
    }

    fn set_acked_features(&mut self, acked_features: u64) {
        self.acked_features = acked_features;
    }

    fn config_size(&self) -> usize {
        mem::size_of::<VirtioBlkConfig>()
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let config_slice = self.config.as_slice();
        let config_len = config_slice.len() as u64;
        if offset >= config_len {
            error!("virtio-blk: config read past the end of config space");
            return;
        }
        let end = std::cmp::min(offset + data.len() as u64, config_len);
        let src = &config_slice[offset as usize..end as usize];
        data[..src.len()].copy_from_slice(src);
    }
}
