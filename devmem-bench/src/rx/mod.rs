//! Devmem receive engine.
//!
//! Each receive call yields payload bytes in a host I/O buffer plus a batch
//! of control messages describing where the rest of the payload landed in
//! the bound dmabuf. The session coalesces those fragments, copies every
//! contiguous run into the destination ring, and returns fragment tokens to
//! the kernel only once their bytes have been copied.

mod coalescer;
mod ring;
mod tokens;

pub use coalescer::{Coalescer, Run};
pub use ring::Ring;
pub use tokens::TokenBatch;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::memory::{MemoryProvider, Region};
use crate::stats::RxCounters;
use crate::wire::{ControlMessage, ControlMessages, FragmentDescriptor, TokenRange};
use tracing::{debug, info, instrument, trace, warn};

/// Outcome of one `recvmsg` on a devmem socket.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Received {
    /// Return value of the receive: payload bytes, linear and dmabuf.
    pub bytes: usize,
    pub control_len: usize,
    /// The kernel had more control data than fit (`MSG_CTRUNC`).
    pub truncated: bool,
}

impl Received {
    pub fn is_close(&self) -> bool {
        self.bytes == 0 && self.control_len == 0
    }
}

/// Receive half of the devmem control channel.
pub trait RxChannel {
    fn recv_devmem(&mut self, iobuf: &mut [u8], control: &mut [u8]) -> Result<Received>;

    /// Hand tokens back to the kernel; returns how many it accepted.
    fn release_tokens(&mut self, ranges: &[TokenRange]) -> Result<usize>;
}

/// Per-connection receive state.
pub struct RxSession<'a, M: MemoryProvider> {
    memory: &'a M,
    source: &'a M::Region,
    dest: &'a mut M::Region,
    dmabuf_id: u32,
    coalescer: Coalescer,
    tokens: TokenBatch,
    ring: Ring,
    foreign_batches: usize,
    foreign_batch_limit: usize,
    counters: RxCounters,
}

impl<'a, M: MemoryProvider> RxSession<'a, M> {
    pub fn new(
        memory: &'a M,
        source: &'a M::Region,
        dest: &'a mut M::Region,
        dmabuf_id: u32,
        config: &EngineConfig,
    ) -> Self {
        let ring = Ring::new(dest.len());
        Self {
            memory,
            source,
            dest,
            dmabuf_id,
            coalescer: Coalescer::new(),
            tokens: TokenBatch::new(config.release_threshold(), config.max_token_ranges),
            ring,
            foreign_batches: 0,
            foreign_batch_limit: config.foreign_batch_limit,
            counters: RxCounters::default(),
        }
    }

    /// Receive until the peer closes, then release everything still pending.
    #[instrument(skip_all, fields(dmabuf_id = self.dmabuf_id), err)]
    pub fn receive_until_close<C: RxChannel>(
        &mut self,
        channel: &mut C,
        config: &EngineConfig,
    ) -> Result<()> {
        let mut iobuf = vec![0u8; config.io_buffer_len];
        let mut control = vec![0u8; config.control_buffer_len()];

        loop {
            let received = channel.recv_devmem(&mut iobuf, &mut control)?;
            if received.truncated {
                return Err(Error::ControlTruncated {
                    capacity: control.len(),
                });
            }
            if received.is_close() {
                info!(bytes = self.counters.bytes, "Peer closed");
                break;
            }
            trace!(bytes = received.bytes, control = received.control_len, "Received");

            let linear = &iobuf[..received.bytes.min(iobuf.len())];
            self.handle_batch(channel, &control[..received.control_len], linear)?;
        }
        self.finish(channel)
    }

    /// Process the control messages of one receive call, in kernel order.
    pub fn handle_batch<C: RxChannel>(
        &mut self,
        channel: &mut C,
        control: &[u8],
        linear: &[u8],
    ) -> Result<()> {
        let mut seen = 0;
        let mut matched = 0;
        let mut linear_used = 0;

        for message in ControlMessages::new(control) {
            match message? {
                ControlMessage::Fragment(fragment) => {
                    seen += 1;
                    if fragment.dmabuf_id != self.dmabuf_id {
                        warn!(
                            got = fragment.dmabuf_id,
                            expected = self.dmabuf_id,
                            "Invalid dmabuf id"
                        );
                        self.counters.foreign_fragments += 1;
                        continue;
                    }
                    matched += 1;
                    self.ingest(fragment)?;
                    self.tokens.record(fragment.token);
                    self.maybe_release(channel)?;
                }
                ControlMessage::Linear { len } => {
                    let bytes = linear.get(linear_used..linear_used + len).ok_or_else(|| {
                        Error::Malformed(format!(
                            "linear fragment {linear_used}+{len} exceeds {} received bytes",
                            linear.len()
                        ))
                    })?;
                    linear_used += len;
                    self.write_linear(bytes)?;
                }
                other => warn!(message = ?other, "Can't handle control message"),
            }
        }
        self.flush_open_run()?;

        if seen > 0 && matched == 0 {
            self.foreign_batches += 1;
            if self.foreign_batches >= self.foreign_batch_limit {
                return Err(Error::ForeignRegion {
                    expected: self.dmabuf_id,
                    batches: self.foreign_batches,
                });
            }
        } else if matched > 0 {
            self.foreign_batches = 0;
        }
        Ok(())
    }

    fn ingest(&mut self, fragment: FragmentDescriptor) -> Result<()> {
        if let Some(run) = self.coalescer.ingest(fragment.offset, fragment.len) {
            self.flush_run(run)?;
        }
        self.counters.fragments += 1;
        Ok(())
    }

    /// Release the token batch once it is full. The open run is copied first
    /// so no released fragment is read again.
    pub fn maybe_release<C: RxChannel>(&mut self, channel: &mut C) -> Result<usize> {
        if !self.tokens.is_full() {
            return Ok(0);
        }
        self.flush_open_run()?;
        self.release(channel)
    }

    fn release<C: RxChannel>(&mut self, channel: &mut C) -> Result<usize> {
        let released = self.tokens.release(channel)?;
        if released > 0 {
            self.counters.tokens_released += released as u64;
            self.counters.releases += 1;
        }
        Ok(released)
    }

    fn flush_open_run(&mut self) -> Result<()> {
        match self.coalescer.take() {
            Some(run) => self.flush_run(run),
            None => Ok(()),
        }
    }

    /// Copy `run` from the source dmabuf to the destination ring.
    pub fn flush_run(&mut self, run: Run) -> Result<()> {
        if run.is_empty() {
            return Ok(());
        }
        let len = run.len() as usize;
        let offset = self.ring.reserve(len);
        self.memory
            .copy(self.dest, offset, self.source, run.start as usize, len)?;
        self.ring.commit(len);
        self.counters.copies += 1;
        self.counters.bytes += len as u64;
        trace!(dst = offset, src = run.start, len, "Copied run");
        Ok(())
    }

    fn write_linear(&mut self, bytes: &[u8]) -> Result<()> {
        self.flush_open_run()?;
        if bytes.is_empty() {
            return Ok(());
        }
        let offset = self.ring.reserve(bytes.len());
        self.memory.upload(self.dest, offset, bytes)?;
        self.ring.commit(bytes.len());
        self.counters.bytes += bytes.len() as u64;
        self.counters.linear_bytes += bytes.len() as u64;
        Ok(())
    }

    /// Copy out the open run and release every pending token.
    pub fn finish<C: RxChannel>(&mut self, channel: &mut C) -> Result<()> {
        self.flush_open_run()?;
        self.release(channel)?;
        debug!(
            aligned = self.coalescer.aligned(),
            non_aligned = self.coalescer.non_aligned(),
            "Session drained"
        );
        Ok(())
    }

    pub fn pending_tokens(&self) -> usize {
        self.tokens.len()
    }

    pub fn write_offset(&self) -> usize {
        self.ring.cursor()
    }

    pub fn counters(&self) -> RxCounters {
        RxCounters {
            aligned: self.coalescer.aligned(),
            non_aligned: self.coalescer.non_aligned(),
            wraps: self.ring.wraps(),
            ..self.counters
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingMemory, ScriptedRx, control_of, fragment, tokens};
    use crate::wire::{self, SCM_DEVMEM_LINEAR};
    use bytes::BytesMut;

    const ID: u32 = 7;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn test_two_runs_in_one_batch() {
        let memory = RecordingMemory::new();
        let source = memory.allocate(8192).unwrap();
        let mut dest = memory.allocate(4096).unwrap();
        let mut channel = ScriptedRx::default();

        let control = control_of(&[
            fragment(ID, 0, 1024, 0),
            fragment(ID, 1024, 1024, 1),
            fragment(ID, 3000, 100, 2),
        ]);
        let mut session = RxSession::new(&memory, &source, &mut dest, ID, &config());
        session.handle_batch(&mut channel, &control, &[]).unwrap();

        assert_eq!(memory.copies(), vec![(0, 0, 2048), (2048, 3000, 100)]);
        assert_eq!(session.pending_tokens(), 3);
        assert!(channel.released.is_empty());

        session.finish(&mut channel).unwrap();
        assert_eq!(channel.released, vec![vec![tokens(0, 3)]]);
        let counters = session.counters();
        assert_eq!(counters.bytes, 2148);
        assert_eq!(counters.tokens_released, 3);
        assert_eq!(counters.aligned, 1);
        assert_eq!(counters.non_aligned, 2);
    }

    #[test]
    fn test_second_run_wraps_to_zero() {
        let memory = RecordingMemory::new();
        let source = memory.allocate(2000).unwrap();
        let mut dest = memory.allocate(1000).unwrap();
        let mut channel = ScriptedRx::default();
        let mut session = RxSession::new(&memory, &source, &mut dest, ID, &config());

        let first = control_of(&[fragment(ID, 0, 1000, 0)]);
        let second = control_of(&[fragment(ID, 1000, 500, 1)]);
        session.handle_batch(&mut channel, &first, &[]).unwrap();
        session.handle_batch(&mut channel, &second, &[]).unwrap();

        assert_eq!(memory.copies(), vec![(0, 0, 1000), (0, 1000, 500)]);
        assert_eq!(session.write_offset(), 500);
        assert_eq!(session.counters().wraps, 1);
    }

    #[test]
    fn test_release_flushes_run_first() {
        let memory = RecordingMemory::new();
        let source = memory.allocate(1 << 16).unwrap();
        let mut dest = memory.allocate(1 << 16).unwrap();
        let mut channel = ScriptedRx {
            copy_log: Some(memory.log()),
            ..Default::default()
        };
        let cfg = EngineConfig {
            max_outstanding_tokens: 4,
            release_headroom: 1,
            ..config()
        };
        let mut session = RxSession::new(&memory, &source, &mut dest, ID, &cfg);

        let fragments: Vec<_> = (0..5)
            .map(|i| fragment(ID, i * 4096, 4096, 10 + i as u32))
            .collect();
        let control = control_of(&fragments);
        session.handle_batch(&mut channel, &control, &[]).unwrap();

        // Third token fills the batch: the run holding all three is copied
        // before the release, and the remaining two start a new run.
        assert_eq!(channel.released, vec![vec![tokens(10, 3)]]);
        assert_eq!(channel.copies_at_release, vec![1]);
        assert_eq!(memory.copies(), vec![(0, 0, 3 * 4096), (3 * 4096, 3 * 4096, 2 * 4096)]);
        assert_eq!(session.pending_tokens(), 2);
    }

    #[test]
    fn test_every_ingested_token_is_released_once() {
        let memory = RecordingMemory::new();
        let source = memory.allocate(1 << 20).unwrap();
        let mut dest = memory.allocate(1 << 16).unwrap();
        let mut channel = ScriptedRx {
            copy_log: Some(memory.log()),
            ..Default::default()
        };
        let cfg = EngineConfig {
            max_outstanding_tokens: 8,
            release_headroom: 2,
            max_token_ranges: 3,
            ..config()
        };
        let mut session = RxSession::new(&memory, &source, &mut dest, ID, &cfg);

        let mut token = 0;
        for batch in 0..10u64 {
            let fragments: Vec<_> = (0..7u64)
                .map(|i| {
                    token += if i % 3 == 0 { 2 } else { 1 };
                    fragment(ID, batch * 65536 + i * 5000, 4000, token)
                })
                .collect();
            let control = control_of(&fragments);
            session.handle_batch(&mut channel, &control, &[]).unwrap();
        }
        session.finish(&mut channel).unwrap();

        let mut released: Vec<u32> = channel
            .released
            .iter()
            .flatten()
            .flat_map(|r| r.token_start..r.end())
            .collect();
        assert_eq!(released.len(), 70);
        released.sort_unstable();
        released.dedup();
        assert_eq!(released.len(), 70);
        assert_eq!(session.counters().tokens_released, 70);
        // Each release follows the copy of the fragment that filled the batch.
        assert_eq!(channel.copies_at_release.len(), channel.released.len());
        assert!(channel.copies_at_release.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_foreign_fragments_are_skipped() {
        let memory = RecordingMemory::new();
        let source = memory.allocate(8192).unwrap();
        let mut dest = memory.allocate(8192).unwrap();
        let mut channel = ScriptedRx::default();
        let mut session = RxSession::new(&memory, &source, &mut dest, ID, &config());

        let control = control_of(&[
            fragment(ID, 0, 100, 0),
            fragment(ID + 1, 100, 100, 1),
            fragment(ID, 100, 100, 2),
        ]);
        session.handle_batch(&mut channel, &control, &[]).unwrap();
        session.finish(&mut channel).unwrap();

        assert_eq!(memory.copies(), vec![(0, 0, 200)]);
        assert_eq!(session.counters().foreign_fragments, 1);
        assert_eq!(channel.released, vec![vec![tokens(0, 1), tokens(2, 1)]]);
    }

    #[test]
    fn test_never_matching_region_is_fatal() {
        let memory = RecordingMemory::new();
        let source = memory.allocate(8192).unwrap();
        let mut dest = memory.allocate(8192).unwrap();
        let mut channel = ScriptedRx::default();
        let cfg = EngineConfig {
            foreign_batch_limit: 3,
            ..config()
        };
        let mut session = RxSession::new(&memory, &source, &mut dest, ID, &cfg);
        let control = control_of(&[fragment(99, 0, 100, 0)]);

        session.handle_batch(&mut channel, &control, &[]).unwrap();
        session.handle_batch(&mut channel, &control, &[]).unwrap();
        assert!(matches!(
            session.handle_batch(&mut channel, &control, &[]),
            Err(Error::ForeignRegion { expected: ID, batches: 3 })
        ));
    }

    #[test]
    fn test_linear_payload_keeps_order() {
        let memory = RecordingMemory::new();
        let mut source = memory.allocate(8192).unwrap();
        memory.upload(&mut source, 0, &[b'a'; 8]).unwrap();
        let mut dest = memory.allocate(64).unwrap();
        let mut channel = ScriptedRx::default();

        let mut control = BytesMut::new();
        control.extend_from_slice(&control_of(&[fragment(ID, 0, 4, 0)]));
        let linear = wire::DmabufCmsg {
            frag_size: 3,
            ..Default::default()
        };
        wire::encode_cmsg(
            &mut control,
            libc::SOL_SOCKET,
            SCM_DEVMEM_LINEAR,
            bytemuck::bytes_of(&linear),
        );
        control.extend_from_slice(&control_of(&[fragment(ID, 4, 4, 1)]));

        {
            let mut session = RxSession::new(&memory, &source, &mut dest, ID, &config());
            session
            .handle_batch(&mut channel, &control, b"xyz")
            .unwrap();
            session.finish(&mut channel).unwrap();
            assert_eq!(session.counters().linear_bytes, 3);
            assert_eq!(session.counters().bytes, 11);
        }
        assert_eq!(&dest.bytes()[..11], b"aaaaxyzaaaa");
    }

    #[test]
    fn test_linear_beyond_received_bytes_is_malformed() {
        let memory = RecordingMemory::new();
        let source = memory.allocate(64).unwrap();
        let mut dest = memory.allocate(64).unwrap();
        let mut channel = ScriptedRx::default();
        let mut control = BytesMut::new();
        let linear = wire::DmabufCmsg {
            frag_size: 10,
            ..Default::default()
        };
        wire::encode_cmsg(
            &mut control,
            libc::SOL_SOCKET,
            SCM_DEVMEM_LINEAR,
            bytemuck::bytes_of(&linear),
        );

        let mut session = RxSession::new(&memory, &source, &mut dest, ID, &config());
        assert!(matches!(
            session.handle_batch(&mut channel, &control, b"abc"),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_receive_until_close() {
        let memory = RecordingMemory::new();
        let source = memory.allocate(8192).unwrap();
        let mut dest = memory.allocate(4096).unwrap();
        let mut channel = ScriptedRx::with_batches(vec![
            (
                2048,
                control_of(&[fragment(ID, 0, 1024, 0), fragment(ID, 1024, 1024, 1)]),
            ),
            (100, control_of(&[fragment(ID, 3000, 100, 2)])),
        ]);

        let mut session = RxSession::new(&memory, &source, &mut dest, ID, &config());
        session
            .receive_until_close(&mut channel, &config())
            .unwrap();

        assert_eq!(memory.copies(), vec![(0, 0, 2048), (2048, 3000, 100)]);
        assert_eq!(channel.released, vec![vec![tokens(0, 3)]]);
        assert_eq!(session.counters().bytes, 2148);
    }

    #[test]
    fn test_truncated_control_is_fatal() {
        let memory = RecordingMemory::new();
        let source = memory.allocate(64).unwrap();
        let mut dest = memory.allocate(64).unwrap();
        let batch = (10, control_of(&[fragment(ID, 0, 10, 0)]));
        let mut channel = ScriptedRx::with_batches(vec![batch]);
        channel.truncate = true;

        let mut session = RxSession::new(&memory, &source, &mut dest, ID, &config());
        assert!(matches!(
            session.receive_until_close(&mut channel, &config()),
            Err(Error::ControlTruncated { .. })
        ));
    }

    #[test]
    fn test_run_larger_than_ring_is_rejected() {
        let memory = RecordingMemory::new();
        let source = memory.allocate(8192).unwrap();
        let mut dest = memory.allocate(1024).unwrap();
        let mut channel = ScriptedRx::default();
        let mut session = RxSession::new(&memory, &source, &mut dest, ID, &config());

        let control = control_of(&[fragment(ID, 0, 2048, 0)]);
        assert!(matches!(
            session.handle_batch(&mut channel, &control, &[]),
            Err(Error::RegionOverrun { .. })
        ));
    }
}
