//! Socket setup and the devmem control channel.

use crate::error::{Error, Result};
use crate::rx::{Received, RxChannel};
use crate::tx::TxChannel;
use crate::wire::{self, MSG_SOCK_DEVMEM, SCM_DEVMEM_DMABUF, SO_DEVMEM_DONTNEED, TokenRange};
use bytes::BytesMut;
use libc::{c_int, c_void, socklen_t};
use socket2::{Domain, Protocol, Socket, Type};
use std::ffi::CString;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd};
use std::time::Duration;
use tracing::{debug, info};

fn failed(op: &'static str) -> impl FnOnce(io::Error) -> Error {
    move |source| Error::Socket { op, source }
}

fn tcp_socket(addr: &SocketAddr) -> Result<Socket> {
    Socket::new(
        Domain::for_address(*addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )
    .map_err(failed("socket"))
}

fn setsockopt_int(
    fd: impl AsFd,
    level: c_int,
    name: c_int,
    value: c_int,
    op: &'static str,
) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd.as_fd().as_raw_fd(),
            level,
            name,
            &value as *const c_int as *const c_void,
            size_of::<c_int>() as socklen_t,
        )
    };
    if ret < 0 {
        return Err(Error::last_os(op));
    }
    Ok(())
}

/// Listening socket with `SO_REUSEADDR` and `SO_REUSEPORT` set.
pub fn listen(addr: SocketAddr) -> Result<TcpListener> {
    let socket = tcp_socket(&addr)?;
    socket
        .set_reuse_address(true)
        .map_err(failed("setsockopt(SO_REUSEADDR)"))?;
    setsockopt_int(
        &socket,
        libc::SOL_SOCKET,
        libc::SO_REUSEPORT,
        1,
        "setsockopt(SO_REUSEPORT)",
    )?;
    socket.bind(&addr.into()).map_err(failed("bind"))?;
    socket.listen(16).map_err(failed("listen"))?;
    info!(%addr, "Listening");
    Ok(socket.into())
}

#[derive(Debug, Default, Clone)]
pub struct ConnectOptions<'a> {
    /// Local address to bind before connecting.
    pub bind: Option<SocketAddr>,
    /// Interface to pin the socket to (`SO_BINDTODEVICE`).
    pub interface: Option<&'a str>,
    pub zerocopy: bool,
}

/// Connect to `peer`, applying the socket options the zero-copy path needs
/// before the first byte is sent.
pub fn connect(peer: SocketAddr, options: &ConnectOptions<'_>) -> Result<TcpStream> {
    let socket = tcp_socket(&peer)?;
    if let Some(interface) = options.interface {
        bind_device(&socket, interface)?;
    }
    if let Some(bind) = options.bind {
        socket
        .set_reuse_address(true)
        .map_err(failed("setsockopt(SO_REUSEADDR)"))?;
        socket.bind(&bind.into()).map_err(failed("bind"))?;
    }
    if options.zerocopy {
        set_zerocopy(&socket)?;
    }
    socket.connect(&peer.into()).map_err(failed("connect"))?;
    debug!(%peer, ?options, "Connected");
    Ok(socket.into())
}

pub fn set_zerocopy(fd: impl AsFd) -> Result<()> {
    setsockopt_int(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ZEROCOPY,
        1,
        "setsockopt(SO_ZEROCOPY)",
    )
}

pub fn bind_device(socket: &Socket, interface: &str) -> Result<()> {
    socket
        .bind_device(Some(interface.as_bytes()))
        .map_err(failed("setsockopt(SO_BINDTODEVICE)"))
}

pub fn if_nametoindex(name: &str) -> Result<u32> {
    let c_name = CString::new(name)
        .map_err(|_| Error::Config(format!("invalid interface name {name:?}")))?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(Error::last_os("if_nametoindex"));
    }
    Ok(index)
}

fn retry_eintr(mut f: impl FnMut() -> isize, op: &'static str) -> Result<usize> {
    loop {
        let ret = f();
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(Error::Socket { op, source: err });
        }
    }
}

/// A connected TCP socket speaking the devmem receive and zero-copy
/// transmit protocols. Closed on drop.
#[derive(Debug)]
pub struct DevmemSocket {
    stream: TcpStream,
}

impl DevmemSocket {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    fn fd(&self) -> c_int {
        self.stream.as_raw_fd()
    }
}

impl RxChannel for DevmemSocket {
    fn recv_devmem(&mut self, iobuf: &mut [u8], control: &mut [u8]) -> Result<Received> {
        let mut iov = libc::iovec {
            iov_base: iobuf.as_mut_ptr() as *mut c_void,
            iov_len: iobuf.len(),
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = control.len() as _;

        let fd = self.fd();
        let bytes = retry_eintr(
            || unsafe { libc::recvmsg(fd, &mut msg, MSG_SOCK_DEVMEM) },
            "recvmsg",
        )?;
        Ok(Received {
            bytes,
            control_len: msg.msg_controllen as usize,
            truncated: msg.msg_flags & libc::MSG_CTRUNC != 0,
        })
    }

    fn release_tokens(&mut self, ranges: &[TokenRange]) -> Result<usize> {
        let data: &[u8] = bytemuck::cast_slice(ranges);
        let ret = unsafe {
            libc::setsockopt(
                self.fd(),
                libc::SOL_SOCKET,
                SO_DEVMEM_DONTNEED,
                data.as_ptr() as *const c_void,
                data.len() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::last_os("setsockopt(SO_DEVMEM_DONTNEED)"));
        }
        Ok(ret as usize)
    }
}

impl TxChannel for DevmemSocket {
    fn send_zerocopy(&mut self, dmabuf_id: u32, offset: u64, len: usize) -> Result<usize> {
        let mut control = BytesMut::with_capacity(wire::cmsg_space(size_of::<u32>()));
        wire::encode_cmsg(
            &mut control,
            libc::SOL_SOCKET,
            SCM_DEVMEM_DMABUF,
            &dmabuf_id.to_ne_bytes(),
        );

        // With a dmabuf cmsg attached, the iov base is an offset into the
        // bound dmabuf rather than a user address.
        let mut iov = libc::iovec {
            iov_base: std::ptr::without_provenance_mut(offset as usize),
            iov_len: len,
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = control.len() as _;

        let fd = self.fd();
        retry_eintr(
            || unsafe { libc::sendmsg(fd, &msg, libc::MSG_ZEROCOPY) },
            "sendmsg",
        )
    }

    fn poll_error_queue(&mut self, timeout: Duration) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd(),
            events: 0,
            revents: 0,
        };
        let millis = timeout.as_millis().min(c_int::MAX as u128) as c_int;
        let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(Error::Socket {
                op: "poll",
                source: err,
            });
        }
        Ok(ret > 0 && pfd.revents & libc::POLLERR != 0)
    }

    fn recv_error_queue(&mut self, control: &mut [u8]) -> Result<Option<usize>> {
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_control = control.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = control.len() as _;

        let fd = self.fd();
        match retry_eintr(
            || unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT) },
            "recvmsg(MSG_ERRQUEUE)",
        ) {
            Ok(_) => {}
            Err(Error::Socket { source, .. }) if source.kind() == io::ErrorKind::WouldBlock => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(Error::ControlTruncated {
                capacity: control.len(),
            });
        }
        Ok(Some(msg.msg_controllen as usize))
    }
}
