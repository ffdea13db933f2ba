// Copyright 2026, Red Hat Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guest physical memory map.
//!
//! The vhost master hands us a table of shared-memory regions; everything the
//! device later touches (rings, descriptors, data buffers) is reached through
//! this map. Lookups validate that a guest-physical range is continuously
//! mapped with the required access before any pointer is produced, so the
//! virtqueue code never dereferences unchecked guest input.

use std::fmt::{self, Display};
use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd};
use std::ptr;

/// Maximum number of regions a single map can hold.
pub const MAX_REGIONS: usize = 16;

#[derive(Debug)]
pub enum Error {
    /// The region table is full.
    OutOfSpace,
    /// The new region intersects one already in the map.
    Overlap,
    /// The requested range is not continuously mapped with the required
    /// access.
    Unmapped,
    /// Mapping a shared memory fd failed.
    Mmap(io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match self {
            OutOfSpace => write!(f, "memory region table is full"),
            Overlap => write!(f, "memory region overlaps an existing one"),
            Unmapped => write!(f, "guest range is not mapped for the required access"),
            Mmap(e) => write!(f, "failed to mmap guest memory: {e}"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// An owned `MAP_SHARED` mapping of master-provided guest memory.
///
/// The fd it was created from can (and should) be closed right after the
/// mapping is established; the mapping itself lives until drop.
#[derive(Debug)]
pub struct GuestMapping {
    addr: *mut u8,
    len: usize,
}

impl GuestMapping {
    /// Map `len` bytes of `fd` starting at `offset`, read-write.
    pub fn from_fd(fd: BorrowedFd, len: usize, offset: u64) -> Result<GuestMapping> {
        if len == 0 {
            return Err(Error::Mmap(io::Error::from_raw_os_error(libc::EINVAL)));
        }

        // SAFETY: a null hint plus a kernel-validated fd/len/offset triple;
        // mmap either produces a fresh private view or fails.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Mmap(io::Error::last_os_error()));
        }

        Ok(GuestMapping {
            addr: addr.cast(),
            len,
        })
    }

    /// Anonymous zero-filled mapping, used to stand in for guest RAM in
    /// tests.
    pub fn anonymous(len: usize) -> Result<GuestMapping> {
        // SAFETY: anonymous mapping, no fd involved.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Mmap(io::Error::last_os_error()));
        }

        Ok(GuestMapping {
            addr: addr.cast(),
            len,
        })
    }

    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for GuestMapping {
    fn drop(&mut self) {
        // SAFETY: created by mmap in this module, unmapped exactly once.
        unsafe { libc::munmap(self.addr.cast(), self.len) };
    }
}

/// A single guest-physical region and the host pointer backing it.
#[derive(Debug)]
pub struct MemoryRegion {
    gpa: u64,
    len: u64,
    hva: *mut u8,
    ro: bool,

    // Present when the region owns its mapping (the control-plane case).
    _mapping: Option<GuestMapping>,
}

impl MemoryRegion {
    /// Region over memory the caller keeps alive for the lifetime of the map.
    pub fn new(gpa: u64, len: u64, hva: *mut u8, ro: bool) -> MemoryRegion {
        MemoryRegion {
            gpa,
            len,
            hva,
            ro,
            _mapping: None,
        }
    }

    /// Region that owns its mapping; the memory is unmapped when the region
    /// is dropped.
    pub fn from_mapping(gpa: u64, mapping: GuestMapping, ro: bool) -> MemoryRegion {
        MemoryRegion {
            gpa,
            len: mapping.len() as u64,
            hva: mapping.addr(),
            ro,
            _mapping: Some(mapping),
        }
    }

    pub fn gpa(&self) -> u64 {
        self.gpa
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_ro(&self) -> bool {
        self.ro
    }

    fn contains(&self, gpa: u64) -> bool {
        gpa >= self.gpa && gpa - self.gpa < self.len
    }

    fn overlaps(&self, other: &MemoryRegion) -> bool {
        // Order the pair so `lo` starts first, then check for intersection.
        let (lo, hi) = if self.gpa <= other.gpa {
            (self, other)
        } else {
            (other, self)
        };
        hi.gpa - lo.gpa < lo.len
    }
}

/// Ordered, bounded table of non-overlapping guest memory regions.
#[derive(Debug, Default)]
pub struct MemoryMap {
    regions: Vec<MemoryRegion>,
}

impl MemoryMap {
    pub fn new() -> MemoryMap {
        MemoryMap::default()
    }

    /// Insert a region at its sorted position.
    pub fn add_region(&mut self, region: MemoryRegion) -> Result<()> {
        if self.regions.len() == MAX_REGIONS {
            return Err(Error::OutOfSpace);
        }

        let pos = self
            .regions
            .iter()
            .position(|r| region.gpa < r.gpa)
            .unwrap_or(self.regions.len());

        if pos > 0 && self.regions[pos - 1].overlaps(&region) {
            return Err(Error::Overlap);
        }
        if pos < self.regions.len() && self.regions[pos].overlaps(&region) {
            return Err(Error::Overlap);
        }

        self.regions.insert(pos, region);
        Ok(())
    }

    /// Resolve `[gpa, gpa + len)` to the host pointer of its first byte.
    ///
    /// The range must be covered by adjacent regions with no gaps. When `ro`
    /// is false the caller intends to write, so every region touched must be
    /// writable.
    pub fn find_range(&self, gpa: u64, len: usize, ro: bool) -> Result<*mut u8> {
        if len == 0 {
            return Err(Error::Unmapped);
        }

        let mut idx = self
            .regions
            .iter()
            .position(|r| r.contains(gpa))
            .ok_or(Error::Unmapped)?;

        let first = &self.regions[idx];
        let res = first.hva.wrapping_add((gpa - first.gpa) as usize);

        let mut gpa = gpa;
        let mut left = len as u64;
        while left > 0 && idx < self.regions.len() {
            let region = &self.regions[idx];

            if !ro && region.ro {
                return Err(Error::Unmapped);
            }

            let remaining = region.len - (gpa - region.gpa);
            let consumed = std::cmp::min(left, remaining);
            left -= consumed;
            gpa = gpa.wrapping_add(consumed);

            idx += 1;

            // Walk into the next region only if it is exactly adjacent.
            if left > 0
                && idx < self.regions.len()
                && self.regions[idx].gpa != region.gpa.wrapping_add(region.len)
            {
                break;
            }
        }

        if left > 0 {
            return Err(Error::Unmapped);
        }
        Ok(res)
    }

    /// Drop every region (and the mappings they own), leaving an empty map.
    pub fn reset(&mut self) {
        self.regions.clear();
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }
}
