// Copyright 2026, Red Hat Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-device vhost-user slave state machine.
//!
//! A `VhostDev` owns the listening socket, at most one master connection,
//! the guest memory map and the vrings. It plugs into the `polly` event
//! manager as a single subscriber handling three event sources: the listen
//! socket, the connection socket and the per-vring kick eventfds. Any
//! protocol violation resets the device and drops the connection; the
//! master is expected to reconnect and renegotiate from scratch.

use std::io;
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use devices::virtio::memory::{GuestMapping, MemoryMap, MemoryRegion};
use devices::virtio::{VirtQueue, VirtioDevice};
use polly::event_manager::{EventManager, Subscriber};
use utils::epoll::{EpollEvent, EventSet};
use vm_memory::ByteValued;

use crate::connection::{self, Endpoint};
use crate::message::*;

// Guest addresses, sizes and mmap offsets must be page-aligned.
const PAGE_SIZE: u64 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("socket path {0} already exists, refusing to reuse it")]
    SocketPathExists(PathBuf),
    #[error("failed to bind listening socket: {0}")]
    Bind(io::Error),
    #[error("device reports no queues")]
    NoQueues,
}

/// A virtio device served over vhost-user.
///
/// On top of the generic virtio surface, the device processes its started
/// vrings when the guest kicks them. A processing error is fatal for the
/// session: the control plane resets the device and drops the connection.
pub trait VhostUserDevice: VirtioDevice {
    fn handle_vring(&mut self, vq: &mut VirtQueue) -> io::Result<()>;
}

/// Control-plane state for one vring.
pub struct Vring {
    size: u16,
    avail_base: u16,

    // Ring addresses as sent by SET_VRING_ADDR, in master address space.
    // Translation to guest-physical happens when the ring starts, so the
    // master may send the memory table and ring addresses in either order.
    desc_uva: u64,
    avail_uva: u64,
    used_uva: u64,
    has_addr: bool,

    kick: Option<OwnedFd>,
    call: Option<Rc<OwnedFd>>,
    err: Option<OwnedFd>,

    enabled: bool,
    started: bool,

    vq: VirtQueue,
}

impl Vring {
    fn new() -> Vring {
        Vring {
            size: 0,
            avail_base: 0,
            desc_uva: 0,
            avail_uva: 0,
            used_uva: 0,
            has_addr: false,
            kick: None,
            call: None,
            err: None,
            enabled: true,
            started: false,
            vq: VirtQueue::new(),
        }
    }

    // Everything needed before the first kick can start the ring.
    fn can_start(&self) -> bool {
        self.size != 0 && self.has_addr && self.kick.is_some()
    }

    fn reset(&mut self, enabled: bool) {
        self.size = 0;
        self.avail_base = 0;
        self.desc_uva = 0;
        self.avail_uva = 0;
        self.used_uva = 0;
        self.has_addr = false;
        self.kick = None;
        self.call = None;
        self.err = None;
        self.enabled = enabled;
        self.started = false;
        self.vq.reset();
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn queue(&self) -> &VirtQueue {
        &self.vq
    }
}

// Master-address-space window recorded at SET_MEM_TABLE time, used to
// translate the ring addresses of SET_VRING_ADDR.
struct UserRegion {
    user_addr: u64,
    size: u64,
    gpa: u64,
}

enum HandlerError {
    /// The request failed; reported through REPLY_ACK when negotiated.
    Failed(i32),
    /// Protocol violation: reset the device and drop the connection.
    Fatal,
}

type HandlerResult = std::result::Result<Option<Vec<u8>>, HandlerError>;

/// Top-level vhost-user device context.
pub struct VhostDev {
    listener: UnixListener,
    socket_path: PathBuf,
    conn: Option<Endpoint>,

    device: Box<dyn VhostUserDevice>,

    mem: Option<Rc<MemoryMap>>,
    user_regions: Vec<UserRegion>,
    vrings: Vec<Vring>,

    // SET_OWNER received on this connection.
    owned: bool,
    acked_protocol_features: u64,
    protocol_features_negotiated: bool,
}

impl VhostDev {
    /// Create a device server listening on `socket_path`.
    ///
    /// Refuses to run if the path already exists, so two backends cannot
    /// silently fight over one socket.
    pub fn new(
        device: Box<dyn VhostUserDevice>,
        num_queues: usize,
        socket_path: &Path,
    ) -> std::result::Result<VhostDev, Error> {
        if num_queues == 0 {
            return Err(Error::NoQueues);
        }
        if socket_path.exists() {
            return Err(Error::SocketPathExists(socket_path.to_path_buf()));
        }

        let listener = UnixListener::bind(socket_path).map_err(Error::Bind)?;

        Ok(VhostDev {
            listener,
            socket_path: socket_path.to_path_buf(),
            conn: None,
            device,
            mem: None,
            user_regions: Vec::new(),
            vrings: (0..num_queues).map(|_| Vring::new()).collect(),
            owned: false,
            acked_protocol_features: 0,
            protocol_features_negotiated: false,
        })
    }

    fn supported_features(&self) -> u64 {
        self.device.avail_features() | (1u64 << VHOST_USER_F_PROTOCOL_FEATURES)
    }

    fn supported_protocol_features() -> u64 {
        (1u64 << VHOST_USER_PROTOCOL_F_MQ)
            | (1u64 << VHOST_USER_PROTOCOL_F_REPLY_ACK)
            | (1u64 << VHOST_USER_PROTOCOL_F_CONFIG)
            | (1u64 << VHOST_USER_PROTOCOL_F_RESET_DEVICE)
    }

    fn reply_ack_negotiated(&self) -> bool {
        self.acked_protocol_features & (1u64 << VHOST_USER_PROTOCOL_F_REPLY_ACK) != 0
    }

    // Query messages always get a reply, whether they succeeded or not.
    fn assumes_reply(req: MasterReq) -> bool {
        matches!(
            req,
            MasterReq::GetFeatures
                | MasterReq::GetProtocolFeatures
                | MasterReq::GetVringBase
                | MasterReq::GetQueueNum
                | MasterReq::GetConfig
                | MasterReq::SetLogBase
                | MasterReq::GetInflightFd
        )
    }

    /// Tear down everything negotiated on the current connection: vrings,
    /// guest memory, feature state.
    fn reset_device(&mut self, event_manager: &mut EventManager) {
        for vring in &mut self.vrings {
            if let Some(kick) = vring.kick.take() {
                let _ = event_manager.unregister(kick.as_raw_fd());
            }
            vring.reset(true);
        }
        self.mem = None;
        self.user_regions.clear();
        self.device.set_acked_features(0);
        self.acked_protocol_features = 0;
        self.protocol_features_negotiated = false;
    }

    fn drop_connection(&mut self, event_manager: &mut EventManager) {
        if let Some(conn) = self.conn.take() {
            let _ = event_manager.unregister(conn.as_raw_fd());
        }
        self.owned = false;
        self.reset_device(event_manager);
    }

    fn handle_accept(&mut self, event_manager: &mut EventManager) {
        let (stream, _) = match self.listener.accept() {
            Ok(conn) => conn,
            Err(e) => {
                error!("vhost: failed to accept connection: {e}");
                return;
            }
        };

        // At most one active master; extra connections are closed on the
        // spot instead of being left pending in the backlog.
        if self.conn.is_some() {
            warn!("vhost: rejecting second master connection");
            return;
        }

        let fd = stream.as_raw_fd();
        let subscriber = match event_manager.subscriber(self.listener.as_raw_fd()) {
            Ok(subscriber) => subscriber,
            Err(e) => {
                error!("vhost: cannot look up own subscriber: {e}");
                return;
            }
        };

        if let Err(e) = event_manager.register(
            fd,
            EpollEvent::new(EventSet::IN | EventSet::HANG_UP, fd as u64),
            subscriber,
        ) {
            error!("vhost: failed to register connection fd: {e}");
            return;
        }

        info!("vhost: master connected");
        self.conn = Some(Endpoint::new(stream));
    }

    fn send_reply(&mut self, request: u32, payload: &[u8]) -> connection::Result<()> {
        match self.conn.as_mut() {
            Some(conn) => conn.send_reply(request, payload),
            None => Ok(()),
        }
    }

    fn handle_connection_readable(&mut self, event_manager: &mut EventManager) {
        let msg = {
            let conn = match self.conn.as_mut() {
                Some(conn) => conn,
                None => return,
            };
            match conn.recv_message() {
                Ok(msg) => msg,
                Err(connection::Error::Disconnected) => {
                    info!("vhost: master disconnected");
                    self.drop_connection(event_manager);
                    return;
                }
                Err(e) => {
                    error!("vhost: dropping connection: {e}");
                    self.drop_connection(event_manager);
                    return;
                }
            }
        };

        let req = msg.req;
        let request = msg.hdr.request();
        let needs_ack = msg.hdr.needs_reply_ack() && self.reply_ack_negotiated();

        debug!("vhost: received {req:?}");

        let outcome = match self.handle_message(msg, event_manager) {
            Ok(reply) => {
                if let Some(payload) = reply {
                    self.send_reply(request, &payload)
                } else if needs_ack {
                    self.send_reply(request, &0u64.to_ne_bytes())
                } else {
                    Ok(())
                }
            }
            Err(HandlerError::Failed(errno)) => {
                warn!("vhost: request {req:?} failed: errno {errno}");
                if Self::assumes_reply(req) || needs_ack {
                    self.send_reply(request, &(-(i64::from(errno)) as u64).to_ne_bytes())
                } else {
                    Ok(())
                }
            }
            Err(HandlerError::Fatal) => {
                error!("vhost: fatal error handling {req:?}, resetting device");
                self.drop_connection(event_manager);
                return;
            }
        };

        if let Err(e) = outcome {
            error!("vhost: failed to send reply: {e}");
            self.drop_connection(event_manager);
        }
    }

    fn handle_message(&mut self, msg: Message, event_manager: &mut EventManager) -> HandlerResult {
        let Message { req, body, fds, .. } = msg;

        match req {
            MasterReq::GetFeatures => {
                Ok(Some(self.supported_features().to_ne_bytes().to_vec()))
            }

            MasterReq::SetFeatures => {
                let features = expect_u64(body)?;
                if features & !self.supported_features() != 0 {
                    error!("vhost: master acked features we never offered: {features:#x}");
                    return Err(HandlerError::Fatal);
                }

                self.protocol_features_negotiated =
                    features & (1u64 << VHOST_USER_F_PROTOCOL_FEATURES) != 0;
                self.device
                    .set_acked_features(features & !(1u64 << VHOST_USER_F_PROTOCOL_FEATURES));

                // Without the protocol-features extension rings start out
                // enabled; with it they stay disabled until
                // SET_VRING_ENABLE.
                for vring in &mut self.vrings {
                    vring.enabled = !self.protocol_features_negotiated;
                }
                Ok(None)
            }

            MasterReq::GetProtocolFeatures => {
                Ok(Some(Self::supported_protocol_features().to_ne_bytes().to_vec()))
            }

            MasterReq::SetProtocolFeatures => {
                let features = expect_u64(body)?;
                if features & !Self::supported_protocol_features() != 0 {
                    error!("vhost: master acked protocol features we never offered: {features:#x}");
                    return Err(HandlerError::Fatal);
                }
                self.acked_protocol_features = features;
                Ok(None)
            }

            MasterReq::SetOwner => {
                if self.owned {
                    error!("vhost: duplicate SET_OWNER");
                    return Err(HandlerError::Fatal);
                }
                self.owned = true;
                Ok(None)
            }

            // The protocol documentation advises to ignore this legacy
            // message.
            MasterReq::ResetOwner => Ok(None),

            MasterReq::ResetDevice => {
                info!("vhost: resetting device on master request");
                self.reset_device(event_manager);
                Ok(None)
            }

            MasterReq::GetQueueNum => Ok(Some((self.vrings.len() as u64).to_ne_bytes().to_vec())),

            MasterReq::SetMemTable => match body {
                MsgBody::MemTable { regions, .. } => self.handle_set_mem_table(regions, fds),
                _ => Err(HandlerError::Fatal),
            },

            MasterReq::SetVringNum => {
                let state = expect_vring_state(body)?;
                let index = self.vring_index(state.index)?;
                let size = u16::try_from(state.num).map_err(|_| {
                    error!("vhost: vring size {} out of range", state.num);
                    HandlerError::Fatal
                })?;
                self.vrings[index].size = size;
                Ok(None)
            }

            MasterReq::SetVringBase => {
                let state = expect_vring_state(body)?;
                let index = self.vring_index(state.index)?;
                let base = u16::try_from(state.num).map_err(|_| {
                    error!("vhost: vring base {} out of range", state.num);
                    HandlerError::Fatal
                })?;
                self.vrings[index].avail_base = base;
                Ok(None)
            }

            MasterReq::SetVringAddr => {
                let addr = match body {
                    MsgBody::VringAddr(addr) => addr,
                    _ => return Err(HandlerError::Fatal),
                };
                let index = self.vring_index(addr.index)?;
                let vring = &mut self.vrings[index];
                vring.desc_uva = addr.descriptor;
                vring.used_uva = addr.used;
                vring.avail_uva = addr.available;
                vring.has_addr = true;
                Ok(None)
            }

            MasterReq::GetVringBase => {
                let state = expect_vring_state(body)?;
                let index = self.vring_index(state.index)?;

                // Stopping a ring reports how far processing got, so the
                // master can restart it later from the same position.
                let vring = &mut self.vrings[index];
                let base = if vring.vq.is_ready() {
                    vring.vq.last_seen_avail()
                } else {
                    vring.avail_base
                };

                if let Some(kick) = vring.kick.take() {
                    let _ = event_manager.unregister(kick.as_raw_fd());
                }
                let enabled = !self.protocol_features_negotiated;
                self.vrings[index].reset(enabled);

                let reply = VhostUserVringState {
                    index: state.index,
                    num: u32::from(base),
                };
                Ok(Some(reply.as_slice().to_vec()))
            }

            MasterReq::SetVringKick => {
                let (index, fd) = self.parse_vring_fd(body, fds)?;

                if let Some(old) = self.vrings[index].kick.take() {
                    let _ = event_manager.unregister(old.as_raw_fd());
                }

                if let Some(fd) = fd {
                    let raw = fd.as_raw_fd();
                    let subscriber = event_manager
                        .subscriber(self.listener.as_raw_fd())
                        .map_err(|e| {
                            error!("vhost: cannot look up own subscriber: {e}");
                            HandlerError::Fatal
                        })?;
                    event_manager
                        .register(raw, EpollEvent::new(EventSet::IN, raw as u64), subscriber)
                        .map_err(|e| {
                            error!("vhost: failed to register kick fd: {e}");
                            HandlerError::Fatal
                        })?;
                    self.vrings[index].kick = Some(fd);
                } else {
                    warn!("vhost: vring {index} configured without a kick fd");
                }
                Ok(None)
            }

            MasterReq::SetVringCall => {
                let (index, fd) = self.parse_vring_fd(body, fds)?;
                let call = fd.map(Rc::new);
                self.vrings[index].call = call.clone();
                if self.vrings[index].vq.is_ready() {
                    self.vrings[index].vq.set_call(call);
                }
                Ok(None)
            }

            MasterReq::SetVringErr => {
                let (index, fd) = self.parse_vring_fd(body, fds)?;
                self.vrings[index].err = fd;
                Ok(None)
            }

            MasterReq::SetVringEnable => {
                let state = expect_vring_state(body)?;
                let index = self.vring_index(state.index)?;
                self.vrings[index].enabled = state.num != 0;
                Ok(None)
            }

            MasterReq::GetConfig => {
                let (cfg, _) = match body {
                    MsgBody::Config { cfg, data } => (cfg, data),
                    _ => return Err(HandlerError::Fatal),
                };

                let size = cfg.size as usize;
                let end = cfg.offset as usize + size;
                if size == 0 || end > self.device.config_size() {
                    return Err(HandlerError::Failed(libc::EINVAL));
                }

                let mut data = vec![0u8; size];
                self.device.read_config(u64::from(cfg.offset), &mut data);

                let mut reply = cfg.as_slice().to_vec();
                reply.extend_from_slice(&data);
                Ok(Some(reply))
            }

            // The block config space is read-only for the driver.
            MasterReq::SetConfig => Err(HandlerError::Failed(libc::ENOTSUP)),

            // Logging, inflight tracking, crypto sessions, postcopy, RARP
            // and friends: opcodes reserved, not implemented.
            _ => Err(HandlerError::Failed(libc::ENOTSUP)),
        }
    }

    fn vring_index(&self, index: u32) -> std::result::Result<usize, HandlerError> {
        let index = index as usize;
        if index >= self.vrings.len() {
            error!("vhost: vring index {index} out of range");
            return Err(HandlerError::Fatal);
        }
        Ok(index)
    }

    // SET_VRING_KICK/CALL/ERR payload: low byte is the ring index, bit 8
    // signals that no fd is enclosed.
    fn parse_vring_fd(
        &self,
        body: MsgBody,
        mut fds: Vec<OwnedFd>,
    ) -> std::result::Result<(usize, Option<OwnedFd>), HandlerError> {
        let value = expect_u64(body)?;
        let index = self.vring_index((value & VRING_FD_INDEX_MASK) as u32)?;

        if value & VRING_FD_INVALID != 0 {
            return Ok((index, None));
        }

        if fds.len() != 1 {
            error!(
                "vhost: expected exactly one fd with vring fd message, got {}",
                fds.len()
            );
            return Err(HandlerError::Fatal);
        }
        Ok((index, Some(fds.remove(0))))
    }

    fn handle_set_mem_table(
        &mut self,
        regions: Vec<VhostUserMemoryRegion>,
        fds: Vec<OwnedFd>,
    ) -> HandlerResult {
        if regions.len() != fds.len() {
            error!(
                "vhost: SET_MEM_TABLE with {} regions but {} fds",
                regions.len(),
                fds.len()
            );
            return Err(HandlerError::Fatal);
        }

        let mut map = MemoryMap::new();
        let mut user_regions = Vec::with_capacity(regions.len());

        for (region, fd) in regions.iter().zip(fds.iter()) {
            if region.size == 0
                || region.guest_addr % PAGE_SIZE != 0
                || region.size % PAGE_SIZE != 0
                || region.mmap_offset % PAGE_SIZE != 0
            {
                error!(
                    "vhost: bad memory region gpa {:#x} size {:#x} offset {:#x}",
                    region.guest_addr, region.size, region.mmap_offset
                );
                return Err(HandlerError::Fatal);
            }

            let mapping = GuestMapping::from_fd(
                fd.as_fd(),
                region.size as usize,
                region.mmap_offset,
            )
            .map_err(|e| {
                error!("vhost: failed to map region at {:#x}: {e}", region.guest_addr);
                HandlerError::Fatal
            })?;

            map.add_region(MemoryRegion::from_mapping(region.guest_addr, mapping, false))
                .map_err(|e| {
                    error!("vhost: failed to insert region at {:#x}: {e}", region.guest_addr);
                    HandlerError::Fatal
                })?;

            user_regions.push(UserRegion {
                user_addr: region.user_addr,
                size: region.size,
                gpa: region.guest_addr,
            });
        }

        // The fresh map replaces the old one wholesale; running rings are
        // re-resolved against it right away. The region fds are closed when
        // `fds` drops, the mappings stay alive inside the map.
        self.mem = Some(Rc::new(map));
        self.user_regions = user_regions;

        for index in 0..self.vrings.len() {
            if self.vrings[index].started {
                self.start_vring_queue(index).map_err(|_| {
                    error!("vhost: failed to re-resolve started vring {index}");
                    HandlerError::Fatal
                })?;
            }
        }

        Ok(None)
    }

    fn uva_to_gpa(&self, uva: u64) -> Option<u64> {
        self.user_regions.iter().find_map(|region| {
            if uva >= region.user_addr && uva - region.user_addr < region.size {
                Some(region.gpa + (uva - region.user_addr))
            } else {
                None
            }
        })
    }

    // Resolve the ring addresses and (re)start the queue of vring `index`.
    fn start_vring_queue(&mut self, index: usize) -> std::result::Result<(), ()> {
        let mem = self.mem.clone().ok_or(())?;

        let (desc_gpa, avail_gpa, used_gpa) = {
            let vring = &self.vrings[index];
            (
                self.uva_to_gpa(vring.desc_uva).ok_or(())?,
                self.uva_to_gpa(vring.avail_uva).ok_or(())?,
                self.uva_to_gpa(vring.used_uva).ok_or(())?,
            )
        };

        let vring = &mut self.vrings[index];
        let call = vring.call.clone();
        vring
            .vq
            .start(
                vring.size,
                desc_gpa,
                avail_gpa,
                used_gpa,
                vring.avail_base,
                mem,
                call,
            )
            .map_err(|e| {
                error!("vhost: failed to start vring {index}: {e}");
            })
    }

    fn handle_kick(&mut self, index: usize, event_manager: &mut EventManager) {
        // Drain the eventfd counter; the kick itself carries no payload.
        if let Some(kick) = &self.vrings[index].kick {
            let mut counter = [0u8; 8];
            if let Err(e) = nix::unistd::read(kick.as_raw_fd(), &mut counter) {
                warn!("vhost: failed to read kick fd for vring {index}: {e}");
            }
        }

        if !self.vrings[index].started {
            if !self.vrings[index].can_start() || self.mem.is_none() {
                // A kick on a half-configured ring is a master bug; note it
                // and carry on.
                error!("vhost: kick on unconfigured vring {index}");
                return;
            }
            if self.start_vring_queue(index).is_err() {
                return;
            }
            self.vrings[index].started = true;
            info!("vhost: vring {index} started");
        }

        if !self.vrings[index].enabled {
            debug!("vhost: ignoring kick on disabled vring {index}");
            return;
        }

        if let Err(e) = self.device.handle_vring(&mut self.vrings[index].vq) {
            error!("vhost: device failed to process vring {index}: {e}");
            self.drop_connection(event_manager);
        }
    }

    fn kick_index(&self, fd: RawFd) -> Option<usize> {
        self.vrings
            .iter()
            .position(|vring| vring.kick.as_ref().map(|k| k.as_raw_fd()) == Some(fd))
    }
}

impl Subscriber for VhostDev {
    fn process(&mut self, event: &EpollEvent, event_manager: &mut EventManager) {
        let source = event.fd();
        let event_set = event.event_set();

        if source == self.listener.as_raw_fd() {
            if event_set.contains(EventSet::IN) {
                self.handle_accept(event_manager);
            }
            return;
        }

        let conn_fd = self.conn.as_ref().map(|conn| conn.as_raw_fd());
        if conn_fd == Some(source) {
            // Reads first; the hangup may follow a final message.
            if event_set.contains(EventSet::IN) {
                self.handle_connection_readable(event_manager);
            }
            if event_set.contains(EventSet::HANG_UP)
                && self.conn.as_ref().map(|conn| conn.as_raw_fd()) == Some(source)
            {
                info!("vhost: master hung up");
                self.drop_connection(event_manager);
            }
            return;
        }

        if let Some(index) = self.kick_index(source) {
            if event_set.contains(EventSet::IN) {
                self.handle_kick(index, event_manager);
            }
            return;
        }

        warn!("vhost: spurious event for fd {source}");
    }

    fn interest_list(&self) -> Vec<EpollEvent> {
        vec![EpollEvent::new(
            EventSet::IN,
            self.listener.as_raw_fd() as u64,
        )]
    }
}

impl Drop for VhostDev {
    fn drop(&mut self) {
        // Best effort; the path may already be gone.
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

fn expect_u64(body: MsgBody) -> std::result::Result<u64, HandlerError> {
    match body {
        MsgBody::U64(value) => Ok(value),
        _ => Err(HandlerError::Fatal),
    }
}

fn expect_vring_state(body: MsgBody) -> std::result::Result<VhostUserVringState, HandlerError> {
    match body {
        MsgBody::VringState(state) => Ok(state),
        _ => Err(HandlerError::Fatal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::ffi::CString;
    use std::io::{IoSlice, Read, Write};
    use std::os::unix::io::FromRawFd;
    use std::ptr;
    use std::sync::{Arc, Mutex};

    use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
    use utils::eventfd::EventFd;
    use utils::tempdir::TempDir;

    use devices::virtio::queue::Descriptor;

    const TEST_FEATURES: u64 = 1u64 << 32; // VIRTIO_F_VERSION_1
    const CONFIG_PATTERN: [u8; 8] = [0x10, 0x32, 0x54, 0x76, 0x98, 0xba, 0xdc, 0xfe];

    #[derive(Default)]
    struct Stats {
        chains: usize,
        buffers: usize,
    }

    struct TestDevice {
        acked_features: u64,
        stats: Rc<RefCell<Stats>>,
        fail_processing: bool,
    }

    impl VirtioDevice for TestDevice {
        fn device_type(&self) -> u32 {
            0
        }

        fn avail_features(&self) -> u64 {
            TEST_FEATURES
        }

        fn acked_features(&self) -> u64 {
            self.acked_features
        }

        fn set_acked_features(&mut self, acked_features: u64) {
            self.acked_features = acked_features;
        }

        fn config_size(&self) -> usize {
            CONFIG_PATTERN.len()
        }

        fn read_config(&self, offset: u64, data: &mut [u8]) {
            let offset = offset as usize;
            if offset >= CONFIG_PATTERN.len() {
                return;
            }
            let end = std::cmp::min(offset + data.len(), CONFIG_PATTERN.len());
            data[..end - offset].copy_from_slice(&CONFIG_PATTERN[offset..end]);
        }
    }

    impl VhostUserDevice for TestDevice {
        fn handle_vring(&mut self, vq: &mut VirtQueue) -> io::Result<()> {
            if self.fail_processing {
                return Err(io::Error::new(io::ErrorKind::Other, "backend failure"));
            }
            loop {
                let mut chain = match vq.pop_avail() {
                    Some(chain) => chain,
                    None => break,
                };
                let mut buffers = 0;
                while chain.next_buffer().is_some() {
                    buffers += 1;
                }
                chain.release(0);

                let mut stats = self.stats.borrow_mut();
                stats.chains += 1;
                stats.buffers += buffers;
                drop(stats);

                vq.signal_used();
            }
            Ok(())
        }
    }

    struct TestMaster {
        stream: UnixStream,
    }

    use std::os::unix::net::UnixStream;

    impl TestMaster {
        fn send(&mut self, req: MasterReq, flags: u32, payload: &[u8], fds: &[RawFd]) {
            let hdr = MsgHeader::new(req as u32, flags, payload.len() as u32);
            if fds.is_empty() {
                self.stream.write_all(hdr.as_slice()).unwrap();
                self.stream.write_all(payload).unwrap();
            } else {
                let iov = [IoSlice::new(hdr.as_slice()), IoSlice::new(payload)];
                let cmsg = [ControlMessage::ScmRights(fds)];
                sendmsg::<()>(
                    self.stream.as_raw_fd(),
                    &iov,
                    &cmsg,
                    MsgFlags::empty(),
                    None,
                )
                .unwrap();
            }
        }

        fn recv_reply(&mut self, req: MasterReq) -> Vec<u8> {
            let mut hdr_bytes = [0u8; VHOST_USER_HDR_SIZE];
            self.stream.read_exact(&mut hdr_bytes).unwrap();

            let mut hdr = MsgHeader::default();
            hdr.as_mut_slice().copy_from_slice(&hdr_bytes);
            assert_eq!(hdr.request(), req as u32);
            assert!(hdr.is_reply());

            let mut payload = vec![0u8; hdr.size() as usize];
            self.stream.read_exact(&mut payload).unwrap();
            payload
        }

        fn recv_u64(&mut self, req: MasterReq) -> u64 {
            let payload = self.recv_reply(req);
            u64::from_ne_bytes(payload.as_slice().try_into().unwrap())
        }

        // true when the backend closed the connection on us.
        fn is_disconnected(&mut self) -> bool {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => true,
                _ => false,
            }
        }
    }

    struct TestEnv {
        event_manager: EventManager,
        dev: Arc<Mutex<VhostDev>>,
        master: TestMaster,
        stats: Rc<RefCell<Stats>>,
        _dir: TempDir,
    }

    fn setup() -> TestEnv {
        setup_with(false)
    }

    fn setup_with(fail_processing: bool) -> TestEnv {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("vhost-test.sock");

        let stats = Rc::new(RefCell::new(Stats::default()));
        let device = TestDevice {
            acked_features: 0,
            stats: stats.clone(),
            fail_processing,
        };

        let dev = Arc::new(Mutex::new(
            VhostDev::new(Box::new(device), 1, &path).unwrap(),
        ));
        let mut event_manager = EventManager::new().unwrap();
        event_manager.add_subscriber(dev.clone()).unwrap();

        let stream = UnixStream::connect(&path).unwrap();
        let mut env = TestEnv {
            event_manager,
            dev,
            master: TestMaster { stream },
            stats,
            _dir: dir,
        };
        env.pump(); // accept the connection
        env
    }

    impl TestEnv {
        // Dispatch until the loop goes quiet.
        fn pump(&mut self) {
            while self.event_manager.run_with_timeout(50).unwrap() > 0 {}
        }
    }

    // Anonymous shared guest memory, mapped on "both sides" through one
    // memfd like a real master would share it.
    struct GuestMem {
        fd: OwnedFd,
        base: *mut u8,
        len: usize,
    }

    impl GuestMem {
        fn new(len: usize) -> GuestMem {
            let name = CString::new("vhost-test-guest").unwrap();
            // SAFETY: plain syscalls creating and mapping a memfd.
            unsafe {
                let fd = libc::memfd_create(name.as_ptr(), 0);
                assert!(fd >= 0);
                assert_eq!(libc::ftruncate(fd, len as libc::off_t), 0);
                let base = libc::mmap(
                    ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    0,
                );
                assert_ne!(base, libc::MAP_FAILED);
                GuestMem {
                    fd: OwnedFd::from_raw_fd(fd),
                    base: base.cast(),
                    len,
                }
            }
        }

        fn write<T>(&self, offset: usize, val: T) {
            assert!(offset + std::mem::size_of::<T>() <= self.len);
            // SAFETY: bounds-checked write into our own mapping.
            unsafe { ptr::write_unaligned(self.base.add(offset) as *mut T, val) };
        }

        fn read<T: Copy>(&self, offset: usize) -> T {
            assert!(offset + std::mem::size_of::<T>() <= self.len);
            // SAFETY: bounds-checked read from our own mapping.
            unsafe { ptr::read_unaligned(self.base.add(offset) as *const T) }
        }
    }

    impl Drop for GuestMem {
        fn drop(&mut self) {
            // SAFETY: mapping created in new(), unmapped once.
            unsafe { libc::munmap(self.base.cast(), self.len) };
        }
    }

    const GUEST_LEN: usize = 0x20000;
    const DESC_OFF: usize = 0x1000;
    const AVAIL_OFF: usize = 0x2000;
    const USED_OFF: usize = 0x3000;
    const DATA_OFF: usize = 0x10000;
    const QSIZE: u16 = 16;

    // Run the full control-plane setup for one ring over `guest`.
    fn configure_ring(env: &mut TestEnv, guest: &GuestMem, kick: &EventFd, call: &EventFd) {
        let m = &mut env.master;

        m.send(MasterReq::GetFeatures, 0, &[], &[]);
        env.pump();
        let features = env.master.recv_u64(MasterReq::GetFeatures);
        assert_ne!(features & (1 << VHOST_USER_F_PROTOCOL_FEATURES), 0);
        assert_ne!(features & TEST_FEATURES, 0);

        env.master
            .send(MasterReq::SetFeatures, 0, &TEST_FEATURES.to_ne_bytes(), &[]);
        env.master.send(MasterReq::SetOwner, 0, &[], &[]);

        let region = VhostUserMemoryRegion {
            guest_addr: 0,
            size: GUEST_LEN as u64,
            user_addr: guest.base as u64,
            mmap_offset: 0,
        };
        let info = VhostUserMemory {
            num_regions: 1,
            padding: 0,
        };
        let mut payload = info.as_slice().to_vec();
        payload.extend_from_slice(region.as_slice());
        env.master.send(
            MasterReq::SetMemTable,
            0,
            &payload,
            &[guest.fd.as_raw_fd()],
        );

        let state = VhostUserVringState {
            index: 0,
            num: u32::from(QSIZE),
        };
        env.master
            .send(MasterReq::SetVringNum, 0, state.as_slice(), &[]);

        let state = VhostUserVringState { index: 0, num: 0 };
        env.master
            .send(MasterReq::SetVringBase, 0, state.as_slice(), &[]);

        let addr = VhostUserVringAddr {
            index: 0,
            flags: 0,
            descriptor: guest.base as u64 + DESC_OFF as u64,
            used: guest.base as u64 + USED_OFF as u64,
            available: guest.base as u64 + AVAIL_OFF as u64,
            log: 0,
        };
        env.master
            .send(MasterReq::SetVringAddr, 0, addr.as_slice(), &[]);

        env.master.send(
            MasterReq::SetVringCall,
            0,
            &0u64.to_ne_bytes(),
            &[call.as_raw_fd()],
        );
        env.master.send(
            MasterReq::SetVringKick,
            0,
            &0u64.to_ne_bytes(),
            &[kick.as_raw_fd()],
        );

        env.pump();
    }

    fn publish_chain(guest: &GuestMem, head: u16, descs: &[Descriptor]) {
        for (i, desc) in descs.iter().enumerate() {
            guest.write(DESC_OFF + 16 * (usize::from(head) + i), *desc);
        }
        let avail_idx: u16 = guest.read(AVAIL_OFF + 2);
        guest.write(
            AVAIL_OFF + 4 + 2 * usize::from(avail_idx & (QSIZE - 1)),
            head,
        );
        guest.write(AVAIL_OFF + 2, avail_idx.wrapping_add(1));
    }

    #[test]
    fn test_feature_handshake() {
        let mut env = setup();

        env.master.send(MasterReq::GetProtocolFeatures, 0, &[], &[]);
        env.pump();
        let features = env.master.recv_u64(MasterReq::GetProtocolFeatures);
        assert_ne!(features & (1 << VHOST_USER_PROTOCOL_F_MQ), 0);
        assert_ne!(features & (1 << VHOST_USER_PROTOCOL_F_REPLY_ACK), 0);
        assert_ne!(features & (1 << VHOST_USER_PROTOCOL_F_CONFIG), 0);
        assert_ne!(features & (1 << VHOST_USER_PROTOCOL_F_RESET_DEVICE), 0);

        env.master.send(
            MasterReq::SetProtocolFeatures,
            0,
            &features.to_ne_bytes(),
            &[],
        );
        env.master.send(MasterReq::GetQueueNum, 0, &[], &[]);
        env.pump();
        assert_eq!(env.master.recv_u64(MasterReq::GetQueueNum), 1);
    }

    #[test]
    fn test_double_set_owner_is_fatal() {
        let mut env = setup();

        env.master.send(MasterReq::SetOwner, 0, &[], &[]);
        env.master.send(MasterReq::SetOwner, 0, &[], &[]);
        env.pump();

        assert!(env.master.is_disconnected());
        assert!(env.dev.lock().unwrap().conn.is_none());
    }

    #[test]
    fn test_unknown_features_are_fatal() {
        let mut env = setup();

        let bogus = TEST_FEATURES | (1u64 << 55);
        env.master
            .send(MasterReq::SetFeatures, 0, &bogus.to_ne_bytes(), &[]);
        env.pump();

        assert!(env.master.is_disconnected());
    }

    #[test]
    fn test_unknown_request_is_fatal() {
        let mut env = setup();

        let hdr = MsgHeader::new(99, 0, 0);
        env.master.stream.write_all(hdr.as_slice()).unwrap();
        env.pump();

        assert!(env.master.is_disconnected());
    }

    #[test]
    fn test_reply_ack() {
        let mut env = setup();

        let ack = 1u64 << VHOST_USER_PROTOCOL_F_REPLY_ACK;
        env.master
            .send(MasterReq::SetProtocolFeatures, 0, &ack.to_ne_bytes(), &[]);

        // An action message with NEED_REPLY gets a zero ack on success.
        let state = VhostUserVringState { index: 0, num: 16 };
        env.master
            .send(MasterReq::SetVringNum, 0x8, state.as_slice(), &[]);
        env.pump();
        assert_eq!(env.master.recv_u64(MasterReq::SetVringNum), 0);

        // An unsupported opcode with NEED_REPLY gets a negative errno.
        env.master
            .send(MasterReq::SetStatus, 0x8, &0u64.to_ne_bytes(), &[]);
        env.pump();
        let res = env.master.recv_u64(MasterReq::SetStatus) as i64;
        assert_eq!(res, -i64::from(libc::ENOTSUP));
    }

    #[test]
    fn test_get_config() {
        let mut env = setup();

        let cfg = VhostUserConfig {
            offset: 0,
            size: 8,
            flags: 0,
        };
        let mut payload = cfg.as_slice().to_vec();
        payload.extend_from_slice(&[0u8; 8]);
        env.master.send(MasterReq::GetConfig, 0, &payload, &[]);
        env.pump();

        let reply = env.master.recv_reply(MasterReq::GetConfig);
        assert_eq!(reply.len(), 12 + 8);
        assert_eq!(&reply[12..], &CONFIG_PATTERN);

        // Reads past the end of config space fail with -EINVAL.
        let cfg = VhostUserConfig {
            offset: 4,
            size: 8,
            flags: 0,
        };
        let mut payload = cfg.as_slice().to_vec();
        payload.extend_from_slice(&[0u8; 8]);
        env.master.send(MasterReq::GetConfig, 0, &payload, &[]);
        env.pump();
        let res = env.master.recv_u64(MasterReq::GetConfig) as i64;
        assert_eq!(res, -i64::from(libc::EINVAL));
    }

    #[test]
    fn test_kick_processes_ring() {
        let mut env = setup();
        let guest = GuestMem::new(GUEST_LEN);
        let kick = EventFd::new(0).unwrap();
        let call = EventFd::new(0).unwrap();

        configure_ring(&mut env, &guest, &kick, &call);

        // One two-buffer chain.
        publish_chain(
            &guest,
            0,
            &[
                Descriptor {
                    addr: DATA_OFF as u64,
                    len: 0x200,
                    flags: devices::virtio::queue::VIRTQ_DESC_F_NEXT,
                    next: 1,
                },
                Descriptor {
                    addr: DATA_OFF as u64 + 0x200,
                    len: 0x200,
                    flags: devices::virtio::queue::VIRTQ_DESC_F_WRITE,
                    next: 0,
                },
            ],
        );

        kick.write(1).unwrap();
        env.pump();

        assert_eq!(env.stats.borrow().chains, 1);
        assert_eq!(env.stats.borrow().buffers, 2);

        // The used ring advanced and the chain head was recorded.
        assert_eq!(guest.read::<u16>(USED_OFF + 2), 1);
        assert_eq!(guest.read::<u32>(USED_OFF + 4), 0);

        // The driver got notified through the call fd.
        assert_eq!(call.read().unwrap(), 1);

        // A second chain on the already-started ring.
        publish_chain(
            &guest,
            4,
            &[Descriptor {
                addr: DATA_OFF as u64 + 0x1000,
                len: 0x200,
                flags: 0,
                next: 0,
            }],
        );
        kick.write(1).unwrap();
        env.pump();

        assert_eq!(env.stats.borrow().chains, 2);
        assert_eq!(guest.read::<u16>(USED_OFF + 2), 2);
    }

    #[test]
    fn test_get_vring_base_stops_ring() {
        let mut env = setup();
        let guest = GuestMem::new(GUEST_LEN);
        let kick = EventFd::new(0).unwrap();
        let call = EventFd::new(0).unwrap();

        configure_ring(&mut env, &guest, &kick, &call);

        publish_chain(
            &guest,
            0,
            &[Descriptor {
                addr: DATA_OFF as u64,
                len: 0x200,
                flags: 0,
                next: 0,
            }],
        );
        kick.write(1).unwrap();
        env.pump();
        assert_eq!(env.stats.borrow().chains, 1);

        let state = VhostUserVringState { index: 0, num: 0 };
        env.master
            .send(MasterReq::GetVringBase, 0, state.as_slice(), &[]);
        env.pump();

        let reply = env.master.recv_reply(MasterReq::GetVringBase);
        let mut got = VhostUserVringState::default();
        got.as_mut_slice().copy_from_slice(&reply);
        assert_eq!(got.index, 0);
        assert_eq!(got.num, 1);

        {
            let dev = env.dev.lock().unwrap();
            assert!(!dev.vrings[0].is_started());
            assert!(dev.vrings[0].kick.is_none());
            assert!(!dev.vrings[0].vq.is_ready());
        }

        // Kicking the stopped ring does nothing.
        kick.write(1).unwrap();
        env.pump();
        assert_eq!(env.stats.borrow().chains, 1);
    }

    #[test]
    fn test_reset_device_clears_state() {
        let mut env = setup();
        let guest = GuestMem::new(GUEST_LEN);
        let kick = EventFd::new(0).unwrap();
        let call = EventFd::new(0).unwrap();

        configure_ring(&mut env, &guest, &kick, &call);

        env.master.send(MasterReq::ResetDevice, 0, &[], &[]);
        env.pump();

        let dev = env.dev.lock().unwrap();
        assert!(dev.mem.is_none());
        assert!(dev.user_regions.is_empty());
        assert!(dev.vrings[0].kick.is_none());
        assert!(!dev.vrings[0].vq.is_ready());
        assert_eq!(dev.device.acked_features(), 0);
        // The connection survives a device reset.
        assert!(dev.conn.is_some());
    }

    #[test]
    fn test_backend_error_drops_connection() {
        let mut env = setup_with(true);
        let guest = GuestMem::new(GUEST_LEN);
        let kick = EventFd::new(0).unwrap();
        let call = EventFd::new(0).unwrap();

        configure_ring(&mut env, &guest, &kick, &call);

        publish_chain(
            &guest,
            0,
            &[Descriptor {
                addr: DATA_OFF as u64,
                len: 0x200,
                flags: 0,
                next: 0,
            }],
        );
        kick.write(1).unwrap();
        env.pump();

        assert!(env.master.is_disconnected());
        assert!(env.dev.lock().unwrap().conn.is_none());
    }

    #[test]
    fn test_socket_path_already_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("vhost-test.sock");
        std::fs::write(&path, b"stale").unwrap();

        let stats = Rc::new(RefCell::new(Stats::default()));
        let device = TestDevice {
            acked_features: 0,
            stats,
            fail_processing: false,
        };
        assert!(matches!(
            VhostDev::new(Box::new(device), 1, &path),
            Err(Error::SocketPathExists(_))
        ));
    }
}
