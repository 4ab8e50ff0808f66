//! Minimal generic-netlink client for the `netdev` family.
//!
//! Binding a dma-buf to NIC queues hands the kernel a reference that lives
//! as long as the netlink socket that created it, so a [`Binding`] owns its
//! socket and the binding is torn down when it is dropped.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::ops::Range;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use tracing::{debug, info};

const NLMSG_HDRLEN: usize = 16;
const GENL_HDRLEN: usize = 4;
const NLA_HDRLEN: usize = 4;

const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_ACK: u16 = 0x4;
const NLMSG_ERROR: u16 = 0x2;
const NLMSG_DONE: u16 = 0x3;
const NLA_F_NESTED: u16 = 1 << 15;
const NLA_TYPE_MASK: u16 = 0x3fff;

const GENL_ID_CTRL: u16 = 0x10;
const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_ATTR_FAMILY_ID: u16 = 1;
const CTRL_ATTR_FAMILY_NAME: u16 = 2;

const NETDEV_FAMILY_NAME: &str = "netdev";
const NETDEV_FAMILY_VERSION: u8 = 1;
const NETDEV_CMD_BIND_RX: u8 = 13;
const NETDEV_CMD_BIND_TX: u8 = 15;

const NETDEV_A_DMABUF_IFINDEX: u16 = 1;
const NETDEV_A_DMABUF_QUEUES: u16 = 2;
const NETDEV_A_DMABUF_FD: u16 = 3;
const NETDEV_A_DMABUF_ID: u16 = 4;

const NETDEV_A_QUEUE_ID: u16 = 1;
const NETDEV_A_QUEUE_TYPE: u16 = 3;
const NETDEV_QUEUE_TYPE_RX: u32 = 0;

const fn nla_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Builds one netlink request: `nlmsghdr`, `genlmsghdr`, attributes.
struct Request {
    buf: BytesMut,
    nests: Vec<usize>,
}

impl Request {
    fn new(family: u16, cmd: u8, version: u8, seq: u32) -> Self {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_u32_ne(0); // patched in finish()
        buf.put_u16_ne(family);
        buf.put_u16_ne(NLM_F_REQUEST | NLM_F_ACK);
        buf.put_u32_ne(seq);
        buf.put_u32_ne(0);
        buf.put_u8(cmd);
        buf.put_u8(version);
        buf.put_u16_ne(0);
        Self {
            buf,
            nests: Vec::new(),
        }
    }

    fn put_attr(&mut self, kind: u16, data: &[u8]) {
        self.buf.put_u16_ne((NLA_HDRLEN + data.len()) as u16);
        self.buf.put_u16_ne(kind);
        self.buf.put_slice(data);
        self.buf.put_bytes(0, nla_align(data.len()) - data.len());
    }

    fn put_u32(&mut self, kind: u16, value: u32) {
        self.put_attr(kind, &value.to_ne_bytes());
    }

    fn put_str(&mut self, kind: u16, value: &str) {
        let mut data = Vec::with_capacity(value.len() + 1);
        data.extend_from_slice(value.as_bytes());
        data.push(0);
        self.put_attr(kind, &data);
    }

    fn begin_nested(&mut self, kind: u16) {
        self.nests.push(self.buf.len());
        self.buf.put_u16_ne(0);
        self.buf.put_u16_ne(kind | NLA_F_NESTED);
    }

    fn end_nested(&mut self) {
        if let Some(start) = self.nests.pop() {
            let len = (self.buf.len() - start) as u16;
            self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
        }
    }

    fn finish(mut self) -> BytesMut {
        let len = self.buf.len() as u32;
        self.buf[..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

/// Iterates `(type, payload)` over a run of netlink attributes.
struct Attributes<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Attributes<'a> {
    type Item = Result<(u16, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.len() < NLA_HDRLEN {
            return None;
        }
        let mut header = self.rest;
        let len = header.get_u16_ne() as usize;
        let kind = header.get_u16_ne() & NLA_TYPE_MASK;
        if len < NLA_HDRLEN || len > self.rest.len() {
            self.rest = &[];
            return Some(Err(Error::netlink(
                "parse",
                format!("attribute length {len} out of bounds"),
            )));
        }
        let payload = &self.rest[NLA_HDRLEN..len];
        self.rest = &self.rest[nla_align(len).min(self.rest.len())..];
        Some(Ok((kind, payload)))
    }
}

fn attributes(data: &[u8]) -> Attributes<'_> {
    Attributes { rest: data }
}

fn find_attr<'a>(data: &'a [u8], kind: u16) -> Result<Option<&'a [u8]>> {
    for attr in attributes(data) {
        let (k, payload) = attr?;
        if k == kind {
            return Ok(Some(payload));
        }
    }
    Ok(None)
}

fn attr_u32(payload: &[u8]) -> Option<u32> {
    payload.get(..4).map(|mut b| b.get_u32_ne())
}

fn attr_u16(payload: &[u8]) -> Option<u16> {
    payload.get(..2).map(|mut b| b.get_u16_ne())
}

/// One message of a reply datagram.
#[derive(Debug, PartialEq, Eq)]
enum Reply<'a> {
    /// Attributes following the generic-netlink header.
    Data(&'a [u8]),
    Ack,
    Done,
}

/// Splits a reply datagram into messages, turning `NLMSG_ERROR` with a
/// nonzero code into an error.
fn parse_replies<'a>(op: &'static str, mut data: &'a [u8]) -> Result<Vec<Reply<'a>>> {
    let mut replies = Vec::new();
    while data.len() >= NLMSG_HDRLEN {
        let mut header = data;
        let len = header.get_u32_ne() as usize;
        let kind = header.get_u16_ne();
        if len < NLMSG_HDRLEN || len > data.len() {
            return Err(Error::netlink(op, format!("message length {len} out of bounds")));
        }
        let body = &data[NLMSG_HDRLEN..len];
        match kind {
            NLMSG_ERROR => {
                let code = body
                    .get(..4)
                    .map(|mut b| b.get_i32_ne())
                    .ok_or_else(|| Error::netlink(op, "short error message"))?;
                if code != 0 {
                    let reason = std::io::Error::from_raw_os_error(-code).to_string();
                    return Err(Error::netlink(op, reason));
                }
                replies.push(Reply::Ack);
            }
            NLMSG_DONE => replies.push(Reply::Done),
            _ => {
                let attrs = body
                    .get(GENL_HDRLEN..)
                    .ok_or_else(|| Error::netlink(op, "short generic netlink header"))?;
                replies.push(Reply::Data(attrs));
            }
        }
        data = &data[nla_align(len).min(data.len())..];
    }
    Ok(replies)
}

fn bind_rx_request(family: u16, seq: u32, ifindex: u32, queues: Range<u32>, fd: u32) -> BytesMut {
    let mut req = Request::new(family, NETDEV_CMD_BIND_RX, NETDEV_FAMILY_VERSION, seq);
    req.put_u32(NETDEV_A_DMABUF_IFINDEX, ifindex);
    req.put_u32(NETDEV_A_DMABUF_FD, fd);
    for queue in queues {
        req.begin_nested(NETDEV_A_DMABUF_QUEUES);
        req.put_u32(NETDEV_A_QUEUE_ID, queue);
        req.put_u32(NETDEV_A_QUEUE_TYPE, NETDEV_QUEUE_TYPE_RX);
        req.end_nested();
    }
    req.finish()
}

fn bind_tx_request(family: u16, seq: u32, ifindex: u32, fd: u32) -> BytesMut {
    let mut req = Request::new(family, NETDEV_CMD_BIND_TX, NETDEV_FAMILY_VERSION, seq);
    req.put_u32(NETDEV_A_DMABUF_IFINDEX, ifindex);
    req.put_u32(NETDEV_A_DMABUF_FD, fd);
    req.finish()
}

/// A netlink socket plus the sequence numbers of its requests.
struct Netlink {
    fd: OwnedFd,
    seq: u32,
}

impl Netlink {
    fn open() -> Result<Self> {
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_GENERIC,
            )
        };
        if raw < 0 {
            return Err(Error::last_os("socket(AF_NETLINK)"));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::last_os("bind(AF_NETLINK)"));
        }
        Ok(Self { fd, seq: 0 })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq += 1;
        self.seq
    }

    /// Send `request` and collect data replies until the kernel acks it.
    fn transact(&mut self, op: &'static str, request: &[u8]) -> Result<Vec<Vec<u8>>> {
        let ret = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                request.as_ptr() as *const libc::c_void,
                request.len(),
                0,
            )
        };
        if ret < 0 {
            return Err(Error::last_os("send(AF_NETLINK)"));
        }

        let mut data = Vec::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let n = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n < 0 {
                return Err(Error::last_os("recv(AF_NETLINK)"));
            }
            for reply in parse_replies(op, &buf[..n as usize])? {
                match reply {
                    Reply::Data(attrs) => data.push(attrs.to_vec()),
                    Reply::Ack | Reply::Done => return Ok(data),
                }
            }
        }
    }

    fn resolve_family(&mut self, name: &str) -> Result<u16> {
        let seq = self.next_seq();
        let mut req = Request::new(GENL_ID_CTRL, CTRL_CMD_GETFAMILY, 1, seq);
        req.put_str(CTRL_ATTR_FAMILY_NAME, name);
        for attrs in self.transact("getfamily", &req.finish())? {
            if let Some(id) = find_attr(&attrs, CTRL_ATTR_FAMILY_ID)?.and_then(attr_u16) {
                debug!(name, id, "Resolved generic netlink family");
                return Ok(id);
            }
        }
        Err(Error::netlink("getfamily", format!("family {name:?} not found")))
    }
}

fn dmabuf_id(op: &'static str, replies: &[Vec<u8>]) -> Result<u32> {
    for attrs in replies {
        if let Some(id) = find_attr(attrs, NETDEV_A_DMABUF_ID)?.and_then(attr_u32) {
            return Ok(id);
        }
    }
    Err(Error::netlink(op, "reply carried no dmabuf id"))
}

/// A dma-buf bound to NIC queues. Unbound when dropped.
pub struct Binding {
    _netlink: OwnedFd,
    id: u32,
}

impl Binding {
    /// Bind `dmabuf` to receive queues `queues` of interface `ifindex`.
    pub fn bind_rx(ifindex: u32, queues: Range<u32>, dmabuf: BorrowedFd<'_>) -> Result<Self> {
        if queues.is_empty() {
            return Err(Error::Config("at least one receive queue must be bound".into()));
        }
        let mut nl = Netlink::open()?;
        let family = nl.resolve_family(NETDEV_FAMILY_NAME)?;
        let seq = nl.next_seq();
        let fd = dmabuf.as_raw_fd() as u32;
        let request = bind_rx_request(family, seq, ifindex, queues.clone(), fd);
        let id = dmabuf_id("bind-rx", &nl.transact("bind-rx", &request)?)?;
        info!(ifindex, ?queues, id, "Bound dmabuf to receive queues");
        Ok(Self {
            _netlink: nl.fd,
            id,
        })
    }

    /// Register `dmabuf` for zero-copy transmit on interface `ifindex`.
    pub fn bind_tx(ifindex: u32, dmabuf: BorrowedFd<'_>) -> Result<Self> {
        let mut nl = Netlink::open()?;
        let family = nl.resolve_family(NETDEV_FAMILY_NAME)?;
        let seq = nl.next_seq();
        let request = bind_tx_request(family, seq, ifindex, dmabuf.as_raw_fd() as u32);
        let id = dmabuf_id("bind-tx", &nl.transact("bind-tx", &request)?)?;
        info!(ifindex, id, "Bound dmabuf for transmit");
        Ok(Self {
            _netlink: nl.fd,
            id,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}
