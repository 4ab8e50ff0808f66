use crate::GI_B;
use crate::error::Result;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Receive-side counters of one or more devmem sessions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RxCounters {
    /// Payload bytes placed in the destination ring.
    pub bytes: u64,
    pub linear_bytes: u64,
    pub fragments: u64,
    pub foreign_fragments: u64,
    /// Fragments contiguous with the preceding one.
    pub aligned: u64,
    pub non_aligned: u64,
    pub copies: u64,
    pub tokens_released: u64,
    pub releases: u64,
    pub wraps: u64,
}

impl RxCounters {
    pub fn merge(&mut self, other: &RxCounters) {
        self.bytes += other.bytes;
        self.linear_bytes += other.linear_bytes;
        self.fragments += other.fragments;
        self.foreign_fragments += other.foreign_fragments;
        self.aligned += other.aligned;
        self.non_aligned += other.non_aligned;
        self.copies += other.copies;
        self.tokens_released += other.tokens_released;
        self.releases += other.releases;
        self.wraps += other.wraps;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TxCounters {
    pub bytes: u64,
    pub sends: u64,
    pub completions: u64,
    /// Completions where the kernel fell back to copying the payload.
    pub copied: u64,
}

impl TxCounters {
    pub fn merge(&mut self, other: &TxCounters) {
        self.bytes += other.bytes;
        self.sends += other.sends;
        self.completions += other.completions;
        self.copied += other.copied;
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Statistics {
    pub bytes_transferred: u64,
    pub elapsed: Duration,
    pub sessions: usize,
    pub rx: RxCounters,
    pub tx: TxCounters,
}

impl Statistics {
    pub fn gib_s(&self) -> f64 {
        self.bytes_transferred as f64 / GI_B as f64 / self.elapsed.as_secs_f64()
    }

    pub fn gbps(&self) -> f64 {
        self.bytes_transferred as f64 * 8.0 / 1e9 / self.elapsed.as_secs_f64()
    }

    pub fn log(&self) {
        let secs = self.elapsed.as_secs_f64();
        let mib = self.bytes_transferred as f64 / (1024.0 * 1024.0);
        if self.rx.fragments > 0 {
            info!(
                aligned = self.rx.aligned,
                non_aligned = self.rx.non_aligned,
                copies = self.rx.copies,
                wraps = self.rx.wraps,
                "Fragment alignment"
            );
        }
        if self.tx.sends > 0 {
            info!(
                sends = self.tx.sends,
                completions = self.tx.completions,
                copied = self.tx.copied,
                "Zero-copy sends"
            );
        }
        info!("Transferred: {mib:.2} MiB in {secs:.3} seconds over {} sessions", self.sessions);
        info!("Throughput: {:.2} GiB/s ({:.6} Gbps)", self.gib_s(), self.gbps());
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self).map_err(std::io::Error::from)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}
