// Copyright 2026, Red Hat Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Vhost-user message definitions and payload decoding.
//!
//! Layouts follow the vhost-user specification shipped with QEMU
//! (docs/interop/vhost-user): a fixed 12-byte header followed by a
//! request-specific payload, with file descriptors attached through a
//! single `SCM_RIGHTS` control message. All numbers are in the machine's
//! native byte order.

use std::os::unix::io::OwnedFd;

use vm_memory::ByteValued;

/// Fixed message header size on the wire.
pub const VHOST_USER_HDR_SIZE: usize = 12;

/// Upper bound for a sane message payload. The largest payloads we accept
/// (memory table, config space) stay well below this.
pub const MAX_MSG_SIZE: usize = 0x1000;

/// At most 8 file descriptors ride along with one message.
pub const MAX_ATTACHED_FDS: usize = 8;

/// Maximum number of regions in a SET_MEM_TABLE payload.
pub const MAX_MEM_REGIONS: usize = 8;

/// Maximum virtio device config space size we expose.
pub const MAX_CONFIG_SIZE: usize = 256;

/// Backend-only feature bit enabling the vhost-user protocol extensions.
pub const VHOST_USER_F_PROTOCOL_FEATURES: u32 = 30;

// Header flag bits.
const VERSION_MASK: u32 = 0x3;
const VERSION_1: u32 = 0x1;
const FLAG_REPLY: u32 = 0x4;
const FLAG_NEED_REPLY: u32 = 0x8;

// Vhost-user protocol feature bits.
pub const VHOST_USER_PROTOCOL_F_MQ: u64 = 0;
pub const VHOST_USER_PROTOCOL_F_LOG_SHMFD: u64 = 1;
pub const VHOST_USER_PROTOCOL_F_RARP: u64 = 2;
pub const VHOST_USER_PROTOCOL_F_REPLY_ACK: u64 = 3;
pub const VHOST_USER_PROTOCOL_F_MTU: u64 = 4;
pub const VHOST_USER_PROTOCOL_F_SLAVE_REQ: u64 = 5;
pub const VHOST_USER_PROTOCOL_F_CROSS_ENDIAN: u64 = 6;
pub const VHOST_USER_PROTOCOL_F_CRYPTO_SESSION: u64 = 7;
pub const VHOST_USER_PROTOCOL_F_PAGEFAULT: u64 = 8;
pub const VHOST_USER_PROTOCOL_F_CONFIG: u64 = 9;
pub const VHOST_USER_PROTOCOL_F_SLAVE_SEND_FD: u64 = 10;
pub const VHOST_USER_PROTOCOL_F_HOST_NOTIFIER: u64 = 11;
pub const VHOST_USER_PROTOCOL_F_INFLIGHT_SHMFD: u64 = 12;
pub const VHOST_USER_PROTOCOL_F_RESET_DEVICE: u64 = 13;

/// In SET_VRING_KICK/CALL/ERR payloads, bit 8 signals that no fd is
/// enclosed; the low byte carries the ring index.
pub const VRING_FD_INDEX_MASK: u64 = 0xff;
pub const VRING_FD_INVALID: u64 = 0x100;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown request id {0}")]
    UnknownRequest(u32),
    #[error("malformed header")]
    InvalidHeader,
    #[error("malformed payload for request {0:?}")]
    InvalidPayload(MasterReq),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Requests a master can send, by wire id.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MasterReq {
    GetFeatures = 1,
    SetFeatures = 2,
    SetOwner = 3,
    ResetOwner = 4,
    SetMemTable = 5,
    SetLogBase = 6,
    SetLogFd = 7,
    SetVringNum = 8,
    SetVringAddr = 9,
    SetVringBase = 10,
    GetVringBase = 11,
    SetVringKick = 12,
    SetVringCall = 13,
    SetVringErr = 14,
    GetProtocolFeatures = 15,
    SetProtocolFeatures = 16,
    GetQueueNum = 17,
    SetVringEnable = 18,
    SendRarp = 19,
    NetSetMtu = 20,
    SetSlaveReqFd = 21,
    IotlbMsg = 22,
    SetVringEndian = 23,
    GetConfig = 24,
    SetConfig = 25,
    CreateCryptoSession = 26,
    CloseCryptoSession = 27,
    PostcopyAdvise = 28,
    PostcopyListen = 29,
    PostcopyEnd = 30,
    GetInflightFd = 31,
    SetInflightFd = 32,
    GpuSetSocket = 33,
    ResetDevice = 34,
    VringKick = 35,
    GetMaxMemSlots = 36,
    AddMemReg = 37,
    RemMemReg = 38,
    SetStatus = 39,
    GetStatus = 40,
}

impl MasterReq {
    pub fn from_u32(value: u32) -> Option<MasterReq> {
        if (1..=40).contains(&value) {
            // Safe because MasterReq is repr(u32) with contiguous ids 1..=40.
            Some(unsafe { std::mem::transmute::<u32, MasterReq>(value) })
        } else {
            None
        }
    }
}

/// Fixed message header: request id, flags, payload size.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct MsgHeader {
    request: u32,
    flags: u32,
    size: u32,
}

// Safe because MsgHeader only contains plain data.
unsafe impl ByteValued for MsgHeader {}

impl MsgHeader {
    pub fn new(request: u32, flags: u32, size: u32) -> MsgHeader {
        MsgHeader {
            request,
            flags: (flags & !VERSION_MASK) | VERSION_1,
            size,
        }
    }

    /// Header for a reply to `request` carrying `size` payload bytes.
    pub fn reply(request: u32, size: u32) -> MsgHeader {
        MsgHeader::new(request, FLAG_REPLY, size)
    }

    pub fn request(&self) -> u32 {
        self.request
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_reply(&self) -> bool {
        self.flags & FLAG_REPLY != 0
    }

    /// The master asked for a REPLY_ACK on this (action) message.
    pub fn needs_reply_ack(&self) -> bool {
        self.flags & FLAG_NEED_REPLY != 0
    }

    pub fn is_valid(&self) -> bool {
        self.flags & VERSION_MASK == VERSION_1 && self.size as usize <= MAX_MSG_SIZE
    }
}

/// Memory region descriptor in a SET_MEM_TABLE payload.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct VhostUserMemoryRegion {
    /// Guest physical address of the region.
    pub guest_addr: u64,
    /// Region size in bytes.
    pub size: u64,
    /// Address of the region in the master's address space.
    pub user_addr: u64,
    /// Offset where the region starts in the mapped fd.
    pub mmap_offset: u64,
}

// Safe because the struct only contains plain data.
unsafe impl ByteValued for VhostUserMemoryRegion {}

/// Header of a SET_MEM_TABLE payload.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct VhostUserMemory {
    pub num_regions: u32,
    pub padding: u32,
}

// Safe because the struct only contains plain data.
unsafe impl ByteValued for VhostUserMemory {}

/// Vring state: index plus one 32-bit value (size, base, enable flag).
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct VhostUserVringState {
    pub index: u32,
    pub num: u32,
}

// Safe because the struct only contains plain data.
unsafe impl ByteValued for VhostUserVringState {}

/// Vring address payload. All ring addresses are in the master's address
/// space; `log` is a guest address and unused here.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct VhostUserVringAddr {
    pub index: u32,
    pub flags: u32,
    pub descriptor: u64,
    pub used: u64,
    pub available: u64,
    pub log: u64,
}

// Safe because the struct only contains plain data.
unsafe impl ByteValued for VhostUserVringAddr {}

/// Config space access header for GET_CONFIG/SET_CONFIG.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct VhostUserConfig {
    pub offset: u32,
    pub size: u32,
    pub flags: u32,
}

// Safe because the struct only contains plain data.
unsafe impl ByteValued for VhostUserConfig {}

/// Decoded message payload.
#[derive(Debug)]
pub enum MsgBody {
    Empty,
    U64(u64),
    VringState(VhostUserVringState),
    VringAddr(VhostUserVringAddr),
    MemTable {
        info: VhostUserMemory,
        regions: Vec<VhostUserMemoryRegion>,
    },
    Config {
        cfg: VhostUserConfig,
        data: Vec<u8>,
    },
    /// Payload of a request we do not interpret.
    Raw(Vec<u8>),
}

/// One received message: header, decoded body and any attached fds.
#[derive(Debug)]
pub struct Message {
    pub hdr: MsgHeader,
    pub req: MasterReq,
    pub body: MsgBody,
    pub fds: Vec<OwnedFd>,
}

// Copy a payload struct out of the (unaligned) receive buffer.
fn body_as<T: ByteValued + Default>(req: MasterReq, buf: &[u8]) -> Result<T> {
    if buf.len() != std::mem::size_of::<T>() {
        return Err(Error::InvalidPayload(req));
    }
    let mut val = T::default();
    val.as_mut_slice().copy_from_slice(buf);
    Ok(val)
}

fn body_u64(req: MasterReq, buf: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = buf.try_into().map_err(|_| Error::InvalidPayload(req))?;
    Ok(u64::from_ne_bytes(bytes))
}

impl Message {
    /// Decode `payload` according to the request id in `hdr`.
    ///
    /// Unknown request ids and shape mismatches are errors; the connection
    /// handler treats both as fatal.
    pub fn decode(hdr: MsgHeader, payload: &[u8], fds: Vec<OwnedFd>) -> Result<Message> {
        let req = MasterReq::from_u32(hdr.request()).ok_or(Error::UnknownRequest(hdr.request()))?;

        let body = match req {
            MasterReq::GetFeatures
            | MasterReq::SetOwner
            | MasterReq::ResetOwner
            | MasterReq::GetProtocolFeatures
            | MasterReq::GetQueueNum
            | MasterReq::ResetDevice => {
                if !payload.is_empty() {
                    return Err(Error::InvalidPayload(req));
                }
                MsgBody::Empty
            }

            MasterReq::SetFeatures
            | MasterReq::SetProtocolFeatures
            | MasterReq::SetVringKick
            | MasterReq::SetVringCall
            | MasterReq::SetVringErr => MsgBody::U64(body_u64(req, payload)?),

            MasterReq::SetVringNum
            | MasterReq::SetVringBase
            | MasterReq::GetVringBase
            | MasterReq::SetVringEnable => {
                MsgBody::VringState(body_as::<VhostUserVringState>(req, payload)?)
            }

            MasterReq::SetVringAddr => {
                MsgBody::VringAddr(body_as::<VhostUserVringAddr>(req, payload)?)
            }

            MasterReq::SetMemTable => {
                let info_size = std::mem::size_of::<VhostUserMemory>();
                let region_size = std::mem::size_of::<VhostUserMemoryRegion>();
                if payload.len() < info_size {
                    return Err(Error::InvalidPayload(req));
                }
                let info = body_as::<VhostUserMemory>(req, &payload[..info_size])?;
                let num = info.num_regions as usize;
                if num == 0
                    || num > MAX_MEM_REGIONS
                    || payload.len() != info_size + num * region_size
                {
                    return Err(Error::InvalidPayload(req));
                }
                let mut regions = Vec::with_capacity(num);
                for chunk in payload[info_size..].chunks(region_size) {
                    regions.push(body_as::<VhostUserMemoryRegion>(req, chunk)?);
                }
                MsgBody::MemTable { info, regions }
            }

            MasterReq::GetConfig | MasterReq::SetConfig => {
                let cfg_size = std::mem::size_of::<VhostUserConfig>();
                if payload.len() < cfg_size {
                    return Err(Error::InvalidPayload(req));
                }
                let cfg = body_as::<VhostUserConfig>(req, &payload[..cfg_size])?;
                let data = payload[cfg_size..].to_vec();
                if cfg.size as usize != data.len() || cfg.size as usize > MAX_CONFIG_SIZE {
                    return Err(Error::InvalidPayload(req));
                }
                MsgBody::Config { cfg, data }
            }

            // Everything else is either unsupported or carries payloads we
            // never look into.
            _ => MsgBody::Raw(payload.to_vec()),
        };

        Ok(Message {
            hdr,
            req,
            body,
            fds,
        })
    }
}
