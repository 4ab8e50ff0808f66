//! Kernel ABI for devmem TCP and `MSG_ZEROCOPY`.
//!
//! The structs below mirror `include/uapi/linux/uio.h` and
//! `include/uapi/linux/errqueue.h` byte for byte. Control data is walked as a
//! plain byte slice: every header and payload length is checked before a
//! struct is read out of it, and reads never assume alignment.

use crate::error::{Error, Result};
use bytemuck::{Pod, Zeroable};
use bytes::{BufMut, BytesMut};
use libc::c_int;

pub const SO_DEVMEM_LINEAR: c_int = 78;
pub const SCM_DEVMEM_LINEAR: c_int = SO_DEVMEM_LINEAR;
pub const SO_DEVMEM_DMABUF: c_int = 79;
pub const SCM_DEVMEM_DMABUF: c_int = SO_DEVMEM_DMABUF;
pub const SO_DEVMEM_DONTNEED: c_int = 80;
pub const MSG_SOCK_DEVMEM: c_int = 0x0200_0000;

pub const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;
pub const SO_EE_CODE_ZEROCOPY_COPIED: u8 = 1;

/// `struct dmabuf_cmsg`
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct DmabufCmsg {
    pub frag_offset: u64,
    pub frag_size: u32,
    pub frag_token: u32,
    pub dmabuf_id: u32,
    pub flags: u32,
}

/// `struct dmabuf_token`: a run of `token_count` tokens starting at `token_start`.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct TokenRange {
    pub token_start: u32,
    pub token_count: u32,
}

impl TokenRange {
    pub fn end(&self) -> u32 {
        self.token_start.wrapping_add(self.token_count)
    }
}

/// `struct sock_extended_err`
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct SockExtendedErr {
    pub ee_errno: u32,
    pub ee_origin: u8,
    pub ee_type: u8,
    pub ee_code: u8,
    pub ee_pad: u8,
    pub ee_info: u32,
    pub ee_data: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct CmsgHeader {
    len: usize,
    level: c_int,
    kind: c_int,
}

/// One received byte range inside a bound dmabuf.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FragmentDescriptor {
    pub dmabuf_id: u32,
    pub token: u32,
    pub offset: u64,
    pub len: u32,
}

impl From<DmabufCmsg> for FragmentDescriptor {
    fn from(c: DmabufCmsg) -> Self {
        Self {
            dmabuf_id: c.dmabuf_id,
            token: c.frag_token,
            offset: c.frag_offset,
            len: c.frag_size,
        }
    }
}

/// Error-queue notification; for zero-copy sends `lo..=hi` is the range of
/// completed send sequence numbers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CompletionRecord {
    pub origin: u8,
    pub errno: u32,
    pub code: u8,
    pub lo: u32,
    pub hi: u32,
}

impl From<SockExtendedErr> for CompletionRecord {
    fn from(e: SockExtendedErr) -> Self {
        Self {
            origin: e.ee_origin,
            errno: e.ee_errno,
            code: e.ee_code,
            lo: e.ee_info,
            hi: e.ee_data,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Fragment(FragmentDescriptor),
    /// Payload delivered into the host I/O buffer instead of the dmabuf.
    Linear { len: usize },
    Completion(CompletionRecord),
    Unknown { level: c_int, kind: c_int },
}

pub const fn cmsg_align(len: usize) -> usize {
    let align = size_of::<usize>();
    (len + align - 1) & !(align - 1)
}

const fn header_len() -> usize {
    cmsg_align(size_of::<CmsgHeader>())
}

/// `CMSG_LEN`
pub const fn cmsg_len(data: usize) -> usize {
    header_len() + data
}

/// `CMSG_SPACE`
pub const fn cmsg_space(data: usize) -> usize {
    header_len() + cmsg_align(data)
}

fn read<T: Pod>(data: &[u8]) -> Result<T> {
    let need = size_of::<T>();
    data.get(..need)
        .map(bytemuck::pod_read_unaligned)
        .ok_or_else(|| {
            Error::Malformed(format!(
                "{} needs {need} bytes, got {}",
                std::any::type_name::<T>(),
                data.len()
            ))
        })
}

fn decode(level: c_int, kind: c_int, data: &[u8]) -> Result<ControlMessage> {
    let msg = match (level, kind) {
        (libc::SOL_SOCKET, SCM_DEVMEM_DMABUF) => {
            ControlMessage::Fragment(read::<DmabufCmsg>(data)?.into())
        }
        (libc::SOL_SOCKET, SCM_DEVMEM_LINEAR) => ControlMessage::Linear {
            len: read::<DmabufCmsg>(data)?.frag_size as usize,
        },
        (libc::SOL_IP, libc::IP_RECVERR) | (libc::SOL_IPV6, libc::IPV6_RECVERR) => {
            ControlMessage::Completion(read::<SockExtendedErr>(data)?.into())
        }
        _ => ControlMessage::Unknown { level, kind },
    };
    Ok(msg)
}

/// Walks the control messages returned by `recvmsg`, in kernel order.
pub struct ControlMessages<'a> {
    rest: &'a [u8],
}

impl<'a> ControlMessages<'a> {
    pub fn new(control: &'a [u8]) -> Self {
        Self { rest: control }
    }
}

impl Iterator for ControlMessages<'_> {
    type Item = Result<ControlMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.len() < header_len() {
            return None;
        }
        let header: CmsgHeader =
            bytemuck::pod_read_unaligned(&self.rest[..size_of::<CmsgHeader>()]);
        if header.len < header_len() || header.len > self.rest.len() {
            let remaining = self.rest.len();
            self.rest = &[];
            return Some(Err(Error::Malformed(format!(
                "cmsg_len {} outside {}..={remaining}",
                header.len,
                header_len()
            ))));
        }

        let data = &self.rest[header_len()..header.len];
        let step = cmsg_align(header.len).min(self.rest.len());
        self.rest = &self.rest[step..];
        Some(decode(header.level, header.kind, data))
    }
}

/// Append one control message to `buf`, padded to `CMSG_SPACE`.
pub fn encode_cmsg(buf: &mut BytesMut, level: c_int, kind: c_int, data: &[u8]) {
    let header = CmsgHeader {
        len: cmsg_len(data.len()),
        level,
        kind,
    };
    buf.put_slice(bytemuck::bytes_of(&header));
    buf.put_bytes(0, header_len() - size_of::<CmsgHeader>());
    buf.put_slice(data);
    buf.put_bytes(0, cmsg_space(data.len()) - cmsg_len(data.len()));
}
