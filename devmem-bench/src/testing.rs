//! Scripted channels and an instrumented memory provider for unit tests.

use crate::error::Result;
use crate::memory::{HostMemory, HostRegion, MemoryProvider};
use crate::rx::{Received, RxChannel};
use crate::tx::TxChannel;
use crate::wire::{self, DmabufCmsg, SCM_DEVMEM_DMABUF, SockExtendedErr, TokenRange};
use bytes::BytesMut;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::BorrowedFd;
use std::rc::Rc;
use std::time::Duration;

pub type CopyLog = Rc<RefCell<Vec<(usize, usize, usize)>>>;

pub fn fragment(dmabuf_id: u32, offset: u64, len: u32, token: u32) -> DmabufCmsg {
    DmabufCmsg {
        frag_offset: offset,
        frag_size: len,
        frag_token: token,
        dmabuf_id,
        flags: 0,
    }
}

pub fn tokens(token_start: u32, token_count: u32) -> TokenRange {
    TokenRange {
        token_start,
        token_count,
    }
}

pub fn control_of(fragments: &[DmabufCmsg]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for f in fragments {
        let payload = bytemuck::bytes_of(f);
        wire::encode_cmsg(&mut buf, libc::SOL_SOCKET, SCM_DEVMEM_DMABUF, payload);
    }
    buf.to_vec()
}

/// Host memory that records every device-to-device copy as
/// `(dst_offset, src_offset, len)`.
#[derive(Default)]
pub struct RecordingMemory {
    inner: HostMemory,
    log: CopyLog,
}

impl RecordingMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn copies(&self) -> Vec<(usize, usize, usize)> {
        self.log.borrow().clone()
    }

    pub fn log(&self) -> CopyLog {
        Rc::clone(&self.log)
    }
}

impl MemoryProvider for RecordingMemory {
    type Region = HostRegion;

    fn allocate(&self, size: usize) -> Result<HostRegion> {
        self.inner.allocate(size)
    }

    fn copy(
        &self,
        dst: &mut HostRegion,
        dst_offset: usize,
        src: &HostRegion,
        src_offset: usize,
        len: usize,
    ) -> Result<()> {
        self.inner.copy(dst, dst_offset, src, src_offset, len)?;
        self.log.borrow_mut().push((dst_offset, src_offset, len));
        Ok(())
    }

    fn upload(&self, dst: &mut HostRegion, dst_offset: usize, src: &[u8]) -> Result<()> {
        self.inner.upload(dst, dst_offset, src)
    }

    fn download(&self, dst: &mut [u8], src: &HostRegion, src_offset: usize) -> Result<()> {
        self.inner.download(dst, src, src_offset)
    }

    fn export<'r>(&self, region: &'r HostRegion) -> Result<BorrowedFd<'r>> {
        self.inner.export(region)
    }
}

/// Receive channel replaying canned `(bytes, control)` batches, then a close.
#[derive(Default)]
pub struct ScriptedRx {
    pub(crate) batches: VecDeque<(usize, Vec<u8>)>,
    /// Report `MSG_CTRUNC` on every receive.
    pub truncate: bool,
    pub released: Vec<Vec<TokenRange>>,
    /// Tokens the fake kernel refuses per release call.
    pub release_shortfall: usize,
    /// When set, the number of copies done so far is noted at each release.
    pub copy_log: Option<CopyLog>,
    pub copies_at_release: Vec<usize>,
}

impl ScriptedRx {
    pub fn with_batches(batches: Vec<(usize, Vec<u8>)>) -> Self {
        Self {
            batches: batches.into(),
            ..Default::default()
        }
    }
}

impl RxChannel for ScriptedRx {
    fn recv_devmem(&mut self, iobuf: &mut [u8], control: &mut [u8]) -> Result<Received> {
        let Some((bytes, cmsgs)) = self.batches.pop_front() else {
            return Ok(Received {
                bytes: 0,
                control_len: 0,
                truncated: false,
            });
        };
        let control_len = cmsgs.len().min(control.len());
        control[..control_len].copy_from_slice(&cmsgs[..control_len]);
        let iobuf_len = iobuf.len();
        iobuf[..bytes.min(iobuf_len)].fill(0);
        Ok(Received {
            bytes,
            control_len,
            truncated: self.truncate,
        })
    }

    fn release_tokens(&mut self, ranges: &[TokenRange]) -> Result<usize> {
        if let Some(log) = &self.copy_log {
            self.copies_at_release.push(log.borrow().len());
        }
        self.released.push(ranges.to_vec());
        let total: usize = ranges.iter().map(|r| r.token_count as usize).sum();
        Ok(total.saturating_sub(self.release_shortfall))
    }
}

/// Transmit channel that completes sends with scripted error-queue records.
#[derive(Default)]
pub struct ScriptedTx {
    /// Bytes accepted per send call; the full request when `None`.
    pub accept: Option<usize>,
    pub sends: Vec<(u32, u64, usize)>,
    /// Records queued by the next send; completes the send in order when empty.
    pub completions: VecDeque<Vec<SockExtendedErr>>,
    /// Never raise `POLLERR`.
    pub silent: bool,
    pub(crate) pending: VecDeque<SockExtendedErr>,
    pub(crate) sequence: u32,
}

impl ScriptedTx {
    pub fn completion(origin: u8, errno: u32, lo: u32, hi: u32) -> SockExtendedErr {
        SockExtendedErr {
            ee_errno: errno,
            ee_origin: origin,
            ee_info: lo,
            ee_data: hi,
            ..Default::default()
        }
    }
}

impl TxChannel for ScriptedTx {
    fn send_zerocopy(&mut self, dmabuf_id: u32, offset: u64, len: usize) -> Result<usize> {
        let sent = self.accept.map_or(len, |a| a.min(len));
        self.sends.push((dmabuf_id, offset, sent));
        match self.completions.pop_front() {
            Some(records) => self.pending.extend(records),
            None => self.pending.push_back(Self::completion(
                wire::SO_EE_ORIGIN_ZEROCOPY,
                0,
                self.sequence,
                self.sequence,
            )),
        }
        self.sequence += 1;
        Ok(sent)
    }

    fn poll_error_queue(&mut self, timeout: Duration) -> Result<bool> {
        if self.silent || self.pending.is_empty() {
            std::thread::sleep(timeout);
            return Ok(false);
        }
        Ok(true)
    }

    fn recv_error_queue(&mut self, control: &mut [u8]) -> Result<Option<usize>> {
        let Some(record) = self.pending.pop_front() else {
            return Ok(None);
        };
        let mut buf = BytesMut::new();
        let payload = bytemuck::bytes_of(&record);
        wire::encode_cmsg(&mut buf, libc::SOL_IP, libc::IP_RECVERR, payload);
        control[..buf.len()].copy_from_slice(&buf);
        Ok(Some(buf.len()))
    }
}
