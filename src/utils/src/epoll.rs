// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Thin safe wrapper over the Linux epoll facility.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use bitflags::bitflags;

/// Operations supported by the epoll interest list.
#[repr(i32)]
pub enum ControlOperation {
    Add = libc::EPOLL_CTL_ADD,
    Modify = libc::EPOLL_CTL_MOD,
    Delete = libc::EPOLL_CTL_DEL,
}

bitflags! {
    /// Event types that can be monitored or reported.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EventSet: u32 {
        const IN = libc::EPOLLIN as u32;
        const OUT = libc::EPOLLOUT as u32;
        const ERROR = libc::EPOLLERR as u32;
        const HANG_UP = libc::EPOLLHUP as u32;
        const READ_HANG_UP = libc::EPOLLRDHUP as u32;
        const EDGE_TRIGGERED = libc::EPOLLET as u32;
    }
}

/// Wrapper over `libc::epoll_event`.
///
/// The `data` field is used by convention to carry the fd the event was
/// registered for, which lets a dispatcher route events without a side table.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct EpollEvent(libc::epoll_event);

impl std::fmt::Debug for EpollEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ events: {}, data: {} }}", self.events(), self.data())
    }
}

impl Default for EpollEvent {
    fn default() -> Self {
        EpollEvent(libc::epoll_event { events: 0, u64: 0 })
    }
}

impl EpollEvent {
    pub fn new(events: EventSet, data: u64) -> Self {
        EpollEvent(libc::epoll_event {
            events: events.bits(),
            u64: data,
        })
    }

    pub fn events(&self) -> u32 {
        self.0.events
    }

    pub fn event_set(&self) -> EventSet {
        // The kernel only reports event bits we know about, but be permissive
        // and drop anything unexpected instead of panicking.
        EventSet::from_bits_truncate(self.events())
    }

    pub fn data(&self) -> u64 {
        self.0.u64
    }

    /// By convention `data` holds the registered fd.
    pub fn fd(&self) -> RawFd {
        self.0.u64 as i32
    }
}

/// Wrapper over an epoll instance.
#[derive(Debug)]
pub struct Epoll {
    epoll_fd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        // SAFETY: epoll_create1 creates a new fd or reports failure; it does
        // not touch caller memory.
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Epoll { epoll_fd })
    }

    pub fn ctl(&self, operation: ControlOperation, fd: RawFd, event: &EpollEvent) -> io::Result<()> {
        // epoll_ctl ignores the event argument for EPOLL_CTL_DEL.
        let mut ev = event.0;
        // SAFETY: self.epoll_fd is a valid epoll fd and `ev` outlives the call.
        let ret = unsafe {
            libc::epoll_ctl(
                self.epoll_fd,
                operation as i32,
                fd,
                &mut ev as *mut libc::epoll_event,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait for events, for at most `timeout` milliseconds (-1 blocks).
    /// Returns the number of entries filled in at the front of `events`.
    pub fn wait(
        &self,
        max_events: usize,
        timeout: i32,
        events: &mut [EpollEvent],
    ) -> io::Result<usize> {
        let max_events = std::cmp::min(max_events, events.len()) as i32;
        loop {
            // SAFETY: EpollEvent is repr(transparent) over libc::epoll_event
            // and the kernel writes at most max_events entries into the
            // buffer.
            let ret = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    events.as_mut_ptr() as *mut libc::epoll_event,
                    max_events,
                    timeout,
                )
            };
            if ret >= 0 {
                return Ok(ret as usize);
            }

            let err = io::Error::last_os_error();
            // A signal landing while we block is routine, not an error.
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll_fd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        // SAFETY: the fd was created by us in `new` and closed exactly once.
        unsafe { libc::close(self.epoll_fd) };
    }
}
