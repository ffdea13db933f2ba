// Copyright 2026, Red Hat Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Unix-socket endpoint for one master connection.
//!
//! Messages are read header-first: the fixed 12-byte header (with any
//! attached fds) in one recvmsg, then exactly `size` payload bytes from the
//! stream. The master is required to send whole messages, so a short read
//! is a protocol error that tears the connection down.

use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::cmsg_space;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessageOwned, MsgFlags};
use vm_memory::ByteValued;

use crate::message::{Message, MsgHeader, MAX_ATTACHED_FDS, VHOST_USER_HDR_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("master closed the connection")]
    Disconnected,
    #[error("short read from master socket")]
    ShortRead,
    #[error("short write to master socket")]
    ShortWrite,
    #[error("malformed message header")]
    InvalidHeader,
    #[error("socket error: {0}")]
    Socket(#[from] nix::Error),
    #[error("stream error: {0}")]
    Stream(#[from] std::io::Error),
    #[error(transparent)]
    Message(#[from] crate::message::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One connected master.
pub struct Endpoint {
    stream: UnixStream,
}

impl Endpoint {
    pub fn new(stream: UnixStream) -> Endpoint {
        Endpoint { stream }
    }

    fn recv_header(&mut self) -> Result<(MsgHeader, Vec<OwnedFd>)> {
        let mut buf = [0u8; VHOST_USER_HDR_SIZE];
        let mut fds = Vec::new();

        let bytes = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let mut cmsg_buffer = cmsg_space!([RawFd; MAX_ATTACHED_FDS]);

            let msg = recvmsg::<()>(
                self.stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )?;

            for cmsg in msg.cmsgs() {
                if let ControlMessageOwned::ScmRights(received) = cmsg {
                    for fd in received {
                        // Safe because SCM_RIGHTS fds are freshly installed
                        // in our fd table and owned by no one else yet.
                        fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }
            }

            msg.bytes
        };

        if bytes == 0 {
            return Err(Error::Disconnected);
        }
        if bytes != VHOST_USER_HDR_SIZE {
            return Err(Error::ShortRead);
        }

        let mut hdr = MsgHeader::default();
        hdr.as_mut_slice().copy_from_slice(&buf);
        if !hdr.is_valid() {
            return Err(Error::InvalidHeader);
        }

        Ok((hdr, fds))
    }

    /// Receive one full message: header, fds and decoded payload.
    pub fn recv_message(&mut self) -> Result<Message> {
        let (hdr, fds) = self.recv_header()?;

        let mut payload = vec![0u8; hdr.size() as usize];
        if !payload.is_empty() {
            self.stream.read_exact(&mut payload)?;
        }

        Ok(Message::decode(hdr, &payload, fds)?)
    }

    /// Send a reply to `request` carrying `payload`.
    pub fn send_reply(&mut self, request: u32, payload: &[u8]) -> Result<()> {
        let hdr = MsgHeader::reply(request, payload.len() as u32);

        let iov = [IoSlice::new(hdr.as_slice()), IoSlice::new(payload)];
        let sent = sendmsg::<()>(
            self.stream.as_raw_fd(),
            &iov,
            &[],
            MsgFlags::empty(),
            None,
        )?;

        if sent != VHOST_USER_HDR_SIZE + payload.len() {
            return Err(Error::ShortWrite);
        }
        Ok(())
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

// Allow tests (and the master side of a socketpair) to push raw bytes.
impl Write for Endpoint {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

impl Read for Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}
