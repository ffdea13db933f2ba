// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! File-backed storage for the block device.

use std::cmp;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::os::linux::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use devices::virtio::block::{BlkIoRequest, BlkIoStatus, IoKind, IoVec, SECTOR_SHIFT, SECTOR_SIZE};
use log::{error, warn};

const VIRTIO_BLK_ID_BYTES: usize = 20;

/// Properties of the file backing a block device, plus the request
/// execution over it.
pub struct DiskProperties {
    file: File,
    nsectors: u64,
    image_id: Vec<u8>,
    read_only: bool,
    writeback: bool,
}

impl DiskProperties {
    pub fn new(disk_image_path: &Path, read_only: bool, writeback: bool) -> io::Result<DiskProperties> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(disk_image_path)?;
        let disk_size = file.seek(SeekFrom::End(0))?;

        // Only whole sectors are exposed; a ragged tail stays invisible.
        if disk_size % SECTOR_SIZE != 0 {
            warn!(
                "disk size {} is not a multiple of sector size {}; \
                 the remainder will not be visible to the guest",
                disk_size, SECTOR_SIZE
            );
        }

        Ok(DiskProperties {
            nsectors: disk_size >> SECTOR_SHIFT,
            image_id: Self::build_disk_image_id(&file),
            file,
            read_only,
            writeback,
        })
    }

    pub fn nsectors(&self) -> u64 {
        self.nsectors
    }

    pub fn image_id(&self) -> &[u8] {
        &self.image_id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_writeback(&self) -> bool {
        self.writeback
    }

    fn build_device_id(disk_file: &File) -> io::Result<String> {
        let blk_metadata = disk_file.metadata()?;
        // This is how kvmtool does it.
        let device_id = format!(
            "{}{}{}",
            blk_metadata.st_dev(),
            blk_metadata.st_rdev(),
            blk_metadata.st_ino()
        );
        Ok(device_id)
    }

    fn build_disk_image_id(disk_file: &File) -> Vec<u8> {
        let mut default_id = vec![0; VIRTIO_BLK_ID_BYTES];
        match Self::build_device_id(disk_file) {
            Err(_) => {
                warn!("could not generate device id, using a default");
            }
            Ok(id) => {
                // The kernel reads at most VIRTIO_BLK_ID_BYTES; leftover
                // bytes stay zero.
                let id = id.as_bytes();
                let bytes_to_copy = cmp::min(id.len(), VIRTIO_BLK_ID_BYTES);
                default_id[..bytes_to_copy].copy_from_slice(&id[..bytes_to_copy]);
            }
        }
        default_id
    }

    /// Execute one parsed request against the backing file.
    pub fn execute(&mut self, bio: &BlkIoRequest) -> BlkIoStatus {
        let result = match bio.kind {
            IoKind::Read => readv_exact_at(&self.file, &bio.iovecs, bio.sector << SECTOR_SHIFT),
            IoKind::Write => writev_exact_at(&self.file, &bio.iovecs, bio.sector << SECTOR_SHIFT),
            IoKind::Flush => {
                if self.writeback {
                    self.file.sync_all()
                } else {
                    Ok(())
                }
            }
            IoKind::GetId => self.write_image_id(bio),
        };

        match result {
            Ok(()) => BlkIoStatus::Ok,
            Err(e) => {
                error!("disk: {:?} request failed: {e}", bio.kind);
                BlkIoStatus::IoError
            }
        }
    }

    fn write_image_id(&self, bio: &BlkIoRequest) -> io::Result<()> {
        let buf = &bio.iovecs[0];
        if buf.len < self.image_id.len() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        // SAFETY: the iovec was validated against the guest memory map as a
        // writable range when the request was parsed.
        unsafe {
            std::ptr::copy_nonoverlapping(self.image_id.as_ptr(), buf.ptr, self.image_id.len())
        };
        Ok(())
    }
}

// Advance an iovec list by `done` bytes after a partial transfer.
fn advance(iov: &mut [libc::iovec], mut done: usize) -> usize {
    let mut idx = 0;
    while done > 0 && idx < iov.len() {
        if done >= iov[idx].iov_len {
            done -= iov[idx].iov_len;
            iov[idx].iov_len = 0;
            idx += 1;
        } else {
            // SAFETY: done is within this iovec's length.
            iov[idx].iov_base = unsafe { (iov[idx].iov_base as *mut u8).add(done) }.cast();
            iov[idx].iov_len -= done;
            done = 0;
        }
    }
    idx
}

fn to_libc_iovecs(iovecs: &[IoVec]) -> Vec<libc::iovec> {
    iovecs
        .iter()
        .map(|v| libc::iovec {
            iov_base: v.ptr.cast(),
            iov_len: v.len,
        })
        .collect()
}

/// Read exactly the bytes described by `iovecs` from `offset`, retrying
/// partial transfers.
fn readv_exact_at(file: &File, iovecs: &[IoVec], mut offset: u64) -> io::Result<()> {
    let mut iov = to_libc_iovecs(iovecs);
    let mut remaining: usize = iovecs.iter().map(|v| v.len).sum();
    let mut idx = 0;

    while remaining > 0 {
        // SAFETY: the iovec list points into guest buffers validated by the
        // request parser; the kernel writes at most remaining bytes.
        let ret = unsafe {
            libc::preadv(
                file.as_raw_fd(),
                iov[idx..].as_ptr(),
                (iov.len() - idx) as libc::c_int,
                offset as libc::off_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if ret == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }

        let done = ret as usize;
        remaining -= done;
        offset += done as u64;
        idx += advance(&mut iov[idx..], done);
    }
    Ok(())
}

/// Write exactly the bytes described by `iovecs` at `offset`, retrying
/// partial transfers.
fn writev_exact_at(file: &File, iovecs: &[IoVec], mut offset: u64) -> io::Result<()> {
    let mut iov = to_libc_iovecs(iovecs);
    let mut remaining: usize = iovecs.iter().map(|v| v.len).sum();
    let mut idx = 0;

    while remaining > 0 {
        // SAFETY: the iovec list points into guest buffers validated by the
        // request parser; the kernel reads at most remaining bytes.
        let ret = unsafe {
            libc::pwritev(
                file.as_raw_fd(),
                iov[idx..].as_ptr(),
                (iov.len() - idx) as libc::c_int,
                offset as libc::off_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if ret == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }

        let done = ret as usize;
        remaining -= done;
        offset += done as u64;
        idx += advance(&mut iov[idx..], done);
    }
    Ok(())
}
