use crate::config::{ClientConfig, EngineConfig};
use crate::error::{Error, Result};
use crate::memory::{MemoryProvider, Region};
use crate::socket::{self, ConnectOptions, DevmemSocket};
use crate::stats::{Statistics, TxCounters};
use crate::transport::{Mode, Session, TxMode};
use crate::tx::{CompletionTracker, TxChannel};
use std::io::Write;
use std::time::Instant;
use tracing::{debug, info, instrument};

/// Connect `config.iterations` times, sending all of `source` on each
/// connection.
#[instrument(
    skip_all,
    fields(mode = ?mode.mode(), peer = %config.peer, iterations = config.iterations),
    err
)]
pub fn run_client<M: MemoryProvider>(
    memory: &M,
    source: &M::Region,
    mode: TxMode,
    config: &ClientConfig,
) -> Result<Statistics> {
    config.engine.validate()?;
    let options = ConnectOptions {
        bind: config.bind,
        interface: config.interface.as_deref(),
        zerocopy: mode.mode() == Mode::Zerocopy,
    };
    let mut stats = Statistics::default();
    let start = Instant::now();

    for iteration in 0..config.iterations {
        let mut session = Session::new(mode.mode());
        let stream = socket::connect(config.peer, &options)?;
        session.establish()?;
        debug!(iteration, "Connected");
        session.stream()?;

        let bytes = match mode {
            TxMode::Tcp => transmit_tcp(memory, source, stream)?,
            TxMode::Devmem { dmabuf_id } => {
                let mut channel = DevmemSocket::new(stream);
                let chunk = config.chunk_size.unwrap_or(source.len());
                let counters = transmit_zerocopy(
                    &mut channel,
                    dmabuf_id,
                    source.len(),
                    chunk,
                    &config.engine,
                )?;
                stats.tx.merge(&counters);
                counters.bytes
            }
        };
        session.close()?;
        info!(iteration, bytes, "Sent buffer");

        stats.bytes_transferred += bytes;
        stats.sessions += 1;
    }

    stats.elapsed = start.elapsed();
    Ok(stats)
}

/// Stage `source` through a host buffer and write it out.
pub fn transmit_tcp<M: MemoryProvider, S: Write>(
    memory: &M,
    source: &M::Region,
    mut stream: S,
) -> Result<u64> {
    let mut bounce = vec![0u8; source.len()];
    memory.download(&mut bounce, source, 0)?;
    stream
        .write_all(&bounce)
        .and_then(|()| stream.flush())
        .map_err(|source| Error::Socket { op: "send", source })?;
    Ok(bounce.len() as u64)
}

/// Send `len` bytes of the bound dmabuf in `chunk`-sized zero-copy sends,
/// confirming each before the next is issued.
pub fn transmit_zerocopy<C: TxChannel>(
    channel: &mut C,
    dmabuf_id: u32,
    len: usize,
    chunk: usize,
    config: &EngineConfig,
) -> Result<TxCounters> {
    if chunk == 0 {
        return Err(Error::Config("chunk size must be non-zero".into()));
    }
    let mut tracker = CompletionTracker::new(dmabuf_id, config);
    let mut offset = 0;

    while offset < len {
        let outstanding = tracker.send(channel, offset as u64, chunk.min(len - offset))?;
        let sent = outstanding.len();
        tracker.wait_for_completion(channel, outstanding)?;
        offset += sent;
    }
    Ok(tracker.counters())
}
