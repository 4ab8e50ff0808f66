use crate::KI_B;
use crate::config::{EngineConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::memory::{MemoryProvider, Region, pattern};
use crate::rx::{RxChannel, RxSession};
use crate::socket::{self, DevmemSocket};
use crate::stats::{RxCounters, Statistics};
use crate::transport::{RxMode, Session};
use std::io::{ErrorKind, Read};
use std::net::TcpListener;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Accept and drain `config.iterations` connections on `config.bind`.
pub fn run_server<M: MemoryProvider>(
    memory: &M,
    dest: &mut M::Region,
    mode: RxMode<'_, M::Region>,
    config: &ServerConfig,
) -> Result<Statistics> {
    let listener = socket::listen(config.bind)?;
    serve(memory, dest, mode, &listener, config)
}

#[instrument(skip_all, fields(mode = ?mode.mode(), iterations = config.iterations), err)]
pub fn serve<M: MemoryProvider>(
    memory: &M,
    dest: &mut M::Region,
    mode: RxMode<'_, M::Region>,
    listener: &TcpListener,
    config: &ServerConfig,
) -> Result<Statistics> {
    config.engine.validate()?;
    let mut stats = Statistics::default();
    let start = Instant::now();

    for iteration in 0..config.iterations {
        let mut session = Session::new(mode.mode());
        let (stream, peer) = listener.accept().map_err(|source| Error::Socket {
            op: "accept",
            source,
        })?;
        session.establish()?;
        info!(iteration, %peer, "Accepted client");
        session.stream()?;

        let (bytes, retained) = match &mode {
            RxMode::Tcp => {
                let bytes = receive_tcp(memory, dest, stream)?;
                (bytes, Some(Retained::bounced(bytes, dest.len())))
            }
            RxMode::Devmem { source, dmabuf_id } => {
                let mut channel = DevmemSocket::new(stream);
                let counters = receive_devmem(
                    memory,
                    source,
                    dest,
                    *dmabuf_id,
                    &mut channel,
                    &config.engine,
                )?;
                stats.rx.merge(&counters);
                (counters.bytes, Retained::unwrapped(&counters))
            }
        };
        session.close()?;
        info!(iteration, bytes, "Client closed");

        stats.bytes_transferred += bytes;
        stats.sessions += 1;

        if config.validate && !validate_received(memory, dest, retained)? {
            warn!(iteration, "Destination ring wrapped, skipping validation");
        }
    }

    stats.elapsed = start.elapsed();
    Ok(stats)
}

/// Stream bytes still held at the start of the destination after a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retained {
    pub len: usize,
    /// Stream offset of the byte at destination offset zero.
    pub start: u64,
}

impl Retained {
    /// The whole devmem session, unless the ring wrapped over part of it.
    pub fn unwrapped(counters: &RxCounters) -> Option<Self> {
        (counters.wraps == 0).then_some(Self {
            len: counters.bytes as usize,
            start: 0,
        })
    }

    /// What a bounce-buffered TCP session of `total` bytes leaves behind: the
    /// last upload, which may be a partial tail.
    pub fn bounced(total: u64, capacity: usize) -> Self {
        let len = match total.checked_sub(1) {
            Some(last) if capacity > 0 => last % capacity as u64 + 1,
            _ => 0,
        };
        Self {
            len: len as usize,
            start: total - len,
        }
    }
}

/// Destination ring for a devmem server receiving `buffer_size` bytes per
/// session. 4 KiB past the buffer keeps a full-buffer session from wrapping.
pub fn devmem_ring_size(buffer_size: usize) -> usize {
    buffer_size + RING_SLACK
}

const RING_SLACK: usize = 4 * KI_B;

/// Check the retained bytes of `dest` against the test pattern. Returns
/// `false` without checking when the ring overwrote part of the stream.
pub fn validate_received<M: MemoryProvider>(
    memory: &M,
    dest: &M::Region,
    retained: Option<Retained>,
) -> Result<bool> {
    let Some(Retained { len, start }) = retained else {
        return Ok(false);
    };
    pattern::validate_region(memory, dest, len.min(dest.len()), start)?;
    Ok(true)
}

/// Read the stream into a host bounce buffer the size of `dest`, uploading
/// it whole each time it fills and once more for a partial tail at close.
pub fn receive_tcp<M: MemoryProvider, S: Read>(
    memory: &M,
    dest: &mut M::Region,
    mut stream: S,
) -> Result<u64> {
    let mut bounce = vec![0u8; dest.len()];
    let mut filled = 0;
    let mut total = 0u64;

    loop {
        let n = match stream.read(&mut bounce[filled..]) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(source) => return Err(Error::Socket { op: "recv", source }),
        };
        if n == 0 {
            break;
        }
        filled += n;
        total += n as u64;
        if filled == bounce.len() {
            memory.upload(dest, 0, &bounce)?;
            filled = 0;
        }
    }
    if filled > 0 {
        memory.upload(dest, 0, &bounce[..filled])?;
    }
    Ok(total)
}

/// Run one devmem session over `channel` until the peer closes.
pub fn receive_devmem<M: MemoryProvider, C: RxChannel>(
    memory: &M,
    source: &M::Region,
    dest: &mut M::Region,
    dmabuf_id: u32,
    channel: &mut C,
    config: &EngineConfig,
) -> Result<RxCounters> {
    let mut session = RxSession::new(memory, source, dest, dmabuf_id, config);
    session.receive_until_close(channel, config)?;
    let counters = session.counters();
    info!(
        aligned = counters.aligned,
        non_aligned = counters.non_aligned,
        tokens = counters.tokens_released,
        "Devmem session finished"
    );
    Ok(counters)
}
