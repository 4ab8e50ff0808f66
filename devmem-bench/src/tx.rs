//! Transmit completion tracking for `MSG_ZEROCOPY` sends out of a dmabuf.
//!
//! The kernel numbers every successful zero-copy `sendmsg` on a socket with
//! a 32-bit sequence, starting at zero, and later reports on the socket
//! error queue which sequence range it is done with. Until that report the
//! source bytes may still be read by the NIC, so exactly one send is kept
//! in flight and its completion is awaited before the region is touched
//! again.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::stats::TxCounters;
use crate::wire::{self, CompletionRecord, ControlMessage, ControlMessages};
use std::ops::Range;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Transmit half of the devmem control channel.
pub trait TxChannel {
    /// Queue up to `len` bytes starting at `offset` in the bound dmabuf.
    /// Returns the number of bytes the kernel accepted.
    fn send_zerocopy(&mut self, dmabuf_id: u32, offset: u64, len: usize) -> Result<usize>;

    /// Wait up to `timeout` for the error queue to become readable.
    fn poll_error_queue(&mut self, timeout: Duration) -> Result<bool>;

    /// Read one error-queue message without blocking. Returns the control
    /// length written, or `None` if the queue is empty.
    fn recv_error_queue(&mut self, control: &mut [u8]) -> Result<Option<usize>>;
}

/// A send the kernel has accepted but not yet reported complete.
#[must_use = "an outstanding send must be waited on before the region is reused"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outstanding {
    pub sequence: u32,
    pub range: Range<u64>,
}

impl Outstanding {
    pub fn len(&self) -> usize {
        (self.range.end - self.range.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

pub struct CompletionTracker {
    dmabuf_id: u32,
    next_sequence: u32,
    in_flight: Option<u32>,
    poll_interval: Duration,
    deadline: Duration,
    control: Vec<u8>,
    counters: TxCounters,
}

impl CompletionTracker {
    pub fn new(dmabuf_id: u32, config: &EngineConfig) -> Self {
        Self {
            dmabuf_id,
            next_sequence: 0,
            in_flight: None,
            poll_interval: config.poll_interval(),
            deadline: config.completion_deadline(),
            // One sock_extended_err plus the offending address.
            control: vec![0u8; wire::cmsg_space(size_of::<wire::SockExtendedErr>() + 128)],
            counters: TxCounters::default(),
        }
    }

    /// Issue one zero-copy send. Fails if the previous send was not confirmed.
    pub fn send<C: TxChannel>(
        &mut self,
        channel: &mut C,
        offset: u64,
        len: usize,
    ) -> Result<Outstanding> {
        if let Some(sequence) = self.in_flight {
            return Err(Error::SendInFlight { sequence });
        }
        let sent = channel.send_zerocopy(self.dmabuf_id, offset, len)?;
        if sent == 0 {
            return Err(Error::Socket {
                op: "sendmsg",
                source: std::io::ErrorKind::WriteZero.into(),
            });
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.in_flight = Some(sequence);
        self.counters.sends += 1;
        self.counters.bytes += sent as u64;
        trace!(sequence, offset, sent, "Zero-copy send queued");

        Ok(Outstanding {
            sequence,
            range: offset..offset + sent as u64,
        })
    }

    /// Block until the kernel reports `outstanding` complete.
    ///
    /// Polls in `poll_interval` cycles until the absolute deadline. A record
    /// from another origin, with a nonzero errno, or not covering the
    /// sequence is fatal, as is running out of time.
    pub fn wait_for_completion<C: TxChannel>(
        &mut self,
        channel: &mut C,
        outstanding: Outstanding,
    ) -> Result<()> {
        let sequence = outstanding.sequence;
        let start = Instant::now();

        loop {
            let remaining = self.deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(Error::CompletionTimeout {
                    sequence,
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
            if !channel.poll_error_queue(self.poll_interval.min(remaining))? {
                debug!(sequence, "No completion yet");
                continue;
            }

            while let Some(len) = channel.recv_error_queue(&mut self.control)? {
                let mut done = false;
                for message in ControlMessages::new(&self.control[..len]) {
                    match message? {
                        ControlMessage::Completion(record) => {
                            if check(sequence, &record)? {
                                self.counters.copied += 1;
                                debug!(sequence, "Kernel copied the payload");
                            }
                            done = true;
                        }
                        other => warn!(message = ?other, "Unexpected error-queue message"),
                    }
                }
                if done {
                    self.in_flight = None;
                    self.counters.completions += 1;
                    trace!(sequence, waited = ?start.elapsed(), "Send completed");
                    return Ok(());
                }
            }
        }
    }

    pub fn counters(&self) -> TxCounters {
        self.counters
    }
}

/// Validate a completion for `sequence`; returns whether the kernel fell
/// back to copying.
fn check(sequence: u32, record: &CompletionRecord) -> Result<bool> {
    if record.origin != wire::SO_EE_ORIGIN_ZEROCOPY || record.errno != 0 {
        return Err(Error::CompletionFailed {
            sequence,
            origin: record.origin,
            errno: record.errno,
        });
    }
    if !(record.lo..=record.hi).contains(&sequence) {
        return Err(Error::CompletionMismatch {
            sequence,
            lo: record.lo,
            hi: record.hi,
        });
    }
    Ok(record.code == wire::SO_EE_CODE_ZEROCOPY_COPIED)
}
