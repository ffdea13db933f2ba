// Copyright 2026, Red Hat Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![doc(hidden)]

//! Helpers for building guest-visible virtqueue layouts in tests.
//!
//! A `TestVq` owns one anonymous mapping laid out the way a driver would
//! place a split virtqueue: descriptor table, avail ring, used ring, plus an
//! extra area for an indirect table and scratch space for request headers
//! and status bytes. The memory map additionally exposes an identity-mapped
//! "data window" at guest address zero, so tests can use plain numbers as
//! data buffer addresses without backing them with real memory (those
//! buffers are never dereferenced by the queue itself).

use std::cell::Cell;
use std::ptr;
use std::rc::Rc;

use crate::virtio::memory::{GuestMapping, MemoryMap, MemoryRegion};
use crate::virtio::queue::{Descriptor, VirtQueue, DESC_ENTRY_SIZE};

/// Identity-mapped data window: `[0, DATA_WINDOW_LEN)`.
pub const DATA_WINDOW_LEN: u64 = 0x2000_0000;

/// Guest address where the ring mapping is installed.
pub const RING_BASE: u64 = 0x4000_0000;

const PAGE_SIZE: usize = 4096;

fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

pub struct TestVq {
    mem: Rc<MemoryMap>,
    base_hva: *mut u8,
    qsize: u16,

    desc_off: usize,
    avail_off: usize,
    used_off: usize,
    itbl_off: usize,
    scratch_off: usize,
    scratch_next: Cell<usize>,
    len: usize,
}

impl TestVq {
    pub fn new(qsize: u16) -> TestVq {
        assert!(qsize.is_power_of_two());
        let q = usize::from(qsize);

        let desc_off = 0;
        let avail_off = desc_off + DESC_ENTRY_SIZE * q;
        let used_off = align_up(avail_off + 6 + 2 * q, PAGE_SIZE);
        let itbl_off = align_up(used_off + 6 + 8 * q, PAGE_SIZE);
        let scratch_off = align_up(itbl_off + DESC_ENTRY_SIZE * q, PAGE_SIZE);
        let len = scratch_off + PAGE_SIZE;

        let mapping = GuestMapping::anonymous(len).expect("failed to map test guest memory");
        let base_hva = mapping.addr();

        let mut map = MemoryMap::new();
        map.add_region(MemoryRegion::new(0, DATA_WINDOW_LEN, ptr::null_mut(), false))
            .unwrap();
        map.add_region(MemoryRegion::from_mapping(RING_BASE, mapping, false))
            .unwrap();

        TestVq {
            mem: Rc::new(map),
            base_hva,
            qsize,
            desc_off,
            avail_off,
            used_off,
            itbl_off,
            scratch_off,
            scratch_next: Cell::new(0),
            len,
        }
    }

    pub fn mem(&self) -> Rc<MemoryMap> {
        self.mem.clone()
    }

    pub fn qsize(&self) -> u16 {
        self.qsize
    }

    pub fn desc_gpa(&self) -> u64 {
        RING_BASE + self.desc_off as u64
    }

    pub fn avail_gpa(&self) -> u64 {
        RING_BASE + self.avail_off as u64
    }

    pub fn used_gpa(&self) -> u64 {
        RING_BASE + self.used_off as u64
    }

    pub fn itbl_gpa(&self) -> u64 {
        RING_BASE + self.itbl_off as u64
    }

    /// Address inside the identity-mapped data window.
    pub fn data_gpa(&self, offset: u64) -> u64 {
        assert!(offset < DATA_WINDOW_LEN);
        offset
    }

    /// Start a fresh queue over this layout.
    pub fn start_queue(&self) -> VirtQueue {
        let mut vq = VirtQueue::new();
        vq.start(
            self.qsize,
            self.desc_gpa(),
            self.avail_gpa(),
            self.used_gpa(),
            0,
            self.mem(),
            None,
        )
        .expect("failed to start test queue");
        vq
    }

    fn at(&self, offset: usize) -> *mut u8 {
        assert!(offset < self.len);
        self.base_hva.wrapping_add(offset)
    }

    pub fn write_desc(&self, id: u16, desc: Descriptor) {
        assert!(id < self.qsize);
        let off = self.desc_off + DESC_ENTRY_SIZE * usize::from(id);
        // SAFETY: within the owned test mapping.
        unsafe { ptr::write_unaligned(self.at(off) as *mut Descriptor, desc) };
    }

    pub fn write_indirect_desc(&self, slot: u16, desc: Descriptor) {
        assert!(slot < self.qsize);
        let off = self.itbl_off + DESC_ENTRY_SIZE * usize::from(slot);
        // SAFETY: within the owned test mapping.
        unsafe { ptr::write_unaligned(self.at(off) as *mut Descriptor, desc) };
    }

    /// Put `head` in the avail ring and bump the avail index, the way a
    /// driver publishes a chain.
    pub fn publish(&self, head: u16) {
        let idx_ptr = self.at(self.avail_off + 2) as *mut u16;
        // SAFETY: within the owned test mapping.
        unsafe {
            let idx = ptr::read_unaligned(idx_ptr);
            let slot = self.avail_off + 4 + 2 * usize::from(idx & (self.qsize - 1));
            ptr::write_unaligned(self.at(slot) as *mut u16, head);
            ptr::write_unaligned(idx_ptr, idx.wrapping_add(1));
        }
    }

    pub fn used_idx(&self) -> u16 {
        // SAFETY: within the owned test mapping.
        unsafe { ptr::read_unaligned(self.at(self.used_off + 2) as *const u16) }
    }

    pub fn used_elem(&self, pos: u16) -> (u32, u32) {
        let off = self.used_off + 4 + 8 * usize::from(pos & (self.qsize - 1));
        // SAFETY: within the owned test mapping.
        unsafe {
            let id = ptr::read_unaligned(self.at(off) as *const u32);
            let len = ptr::read_unaligned(self.at(off + 4) as *const u32);
            (id, len)
        }
    }

    /// Carve `len` bytes (16-byte aligned) out of the scratch page and
    /// return their guest address. Used for request headers and status
    /// bytes that must live in real memory.
    pub fn alloc_scratch(&self, len: usize) -> u64 {
        let start = align_up(self.scratch_next.get(), 16);
        assert!(start + len <= PAGE_SIZE, "test scratch space exhausted");
        self.scratch_next.set(start + len);
        RING_BASE + (self.scratch_off + start) as u64
    }

    pub fn write_bytes(&self, gpa: u64, data: &[u8]) {
        let ptr = self
            .mem
            .find_range(gpa, data.len(), false)
            .expect("write_bytes target not mapped");
        // SAFETY: the range was just validated against the map and the
        // backing mapping is owned by this TestVq.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
    }

    pub fn read_bytes(&self, gpa: u64, data: &mut [u8]) {
        let ptr = self
            .mem
            .find_range(gpa, data.len(), true)
            .expect("read_bytes source not mapped");
        // SAFETY: as in write_bytes.
        unsafe { ptr::copy_nonoverlapping(ptr, data.as_mut_ptr(), data.len()) };
    }

    pub fn read_byte(&self, gpa: u64) -> u8 {
        let mut byte = [0u8; 1];
        self.read_bytes(gpa, &mut byte);
        byte[0]
    }
}
