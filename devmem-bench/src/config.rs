//! Runtime-configurable tuning parameters for the receive and transmit engines.
//!
//! All values have defaults matching the kernel limits of the devmem socket
//! API. Override them with a JSON file (`EngineConfig::load`) and/or
//! environment variables prefixed `DEVMEM_`.

use crate::error::{Error, Result};
use crate::wire;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the host I/O buffer handed to every receive call.
    pub io_buffer_len: usize,

    /// Number of fragment descriptors the control buffer can hold per receive.
    pub control_descriptors: usize,

    /// Kernel limit on tokens released by a single `SO_DEVMEM_DONTNEED` call.
    pub max_outstanding_tokens: usize,

    /// Tokens kept free below `max_outstanding_tokens` for the receive in flight.
    pub release_headroom: usize,

    /// Kernel limit on token ranges in one release call.
    pub max_token_ranges: usize,

    /// Length of one error-queue poll cycle.
    pub poll_interval_ms: u64,

    /// Absolute deadline for a transmit completion to arrive.
    pub completion_deadline_ms: u64,

    /// Consecutive receive batches without a single matching fragment before
    /// the session is declared stuck.
    pub foreign_batch_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            io_buffer_len: 819_200,
            control_descriptors: 10_000,
            max_outstanding_tokens: 1024,
            release_headroom: 128,
            max_token_ranges: 128,
            poll_interval_ms: 100,
            completion_deadline_ms: 10_000,
            foreign_batch_limit: 16,
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file; missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Apply `DEVMEM_*` environment variables on top of `self`.
    ///
    /// Recognized variables:
    /// - `DEVMEM_IO_BUFFER_LEN`
    /// - `DEVMEM_CONTROL_DESCRIPTORS`
    /// - `DEVMEM_MAX_OUTSTANDING_TOKENS`
    /// - `DEVMEM_RELEASE_HEADROOM`
    /// - `DEVMEM_MAX_TOKEN_RANGES`
    /// - `DEVMEM_POLL_INTERVAL_MS`
    /// - `DEVMEM_COMPLETION_DEADLINE_MS`
    /// - `DEVMEM_FOREIGN_BATCH_LIMIT`
    pub fn with_env(self) -> Self {
        self.with_overrides(|name| env::var(name).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn apply<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, field: &mut T) {
            if let Some(v) = lookup(name) {
                match v.parse() {
                    Ok(parsed) => *field = parsed,
                    Err(_) => tracing::warn!(name, value = %v, "Ignoring unparsable override"),
                }
            }
        }

        apply(&lookup, "DEVMEM_IO_BUFFER_LEN", &mut self.io_buffer_len);
        apply(
            &lookup,
            "DEVMEM_CONTROL_DESCRIPTORS",
            &mut self.control_descriptors,
        );
        apply(
            &lookup,
            "DEVMEM_MAX_OUTSTANDING_TOKENS",
            &mut self.max_outstanding_tokens,
        );
        apply(
            &lookup,
            "DEVMEM_RELEASE_HEADROOM",
            &mut self.release_headroom,
        );
        apply(
            &lookup,
            "DEVMEM_MAX_TOKEN_RANGES",
            &mut self.max_token_ranges,
        );
        apply(
            &lookup,
            "DEVMEM_POLL_INTERVAL_MS",
            &mut self.poll_interval_ms,
        );
        apply(
            &lookup,
            "DEVMEM_COMPLETION_DEADLINE_MS",
            &mut self.completion_deadline_ms,
        );
        apply(
            &lookup,
            "DEVMEM_FOREIGN_BATCH_LIMIT",
            &mut self.foreign_batch_limit,
        );
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.io_buffer_len == 0 {
            return Err(Error::Config("io_buffer_len must be non-zero".into()));
        }
        if self.control_descriptors == 0 {
            return Err(Error::Config("control_descriptors must be non-zero".into()));
        }
        if self.release_headroom >= self.max_outstanding_tokens {
            return Err(Error::Config(format!(
                "release_headroom {} leaves no room below max_outstanding_tokens {}",
                self.release_headroom, self.max_outstanding_tokens
            )));
        }
        if self.max_token_ranges == 0 {
            return Err(Error::Config("max_token_ranges must be non-zero".into()));
        }
        if self.poll_interval_ms == 0 || self.completion_deadline_ms < self.poll_interval_ms {
            return Err(Error::Config(format!(
                "completion deadline {}ms must cover at least one poll interval of {}ms",
                self.completion_deadline_ms, self.poll_interval_ms
            )));
        }
        Ok(())
    }

    /// Token count at which a batch is flushed and released.
    pub fn release_threshold(&self) -> usize {
        self.max_outstanding_tokens - self.release_headroom
    }

    pub fn control_buffer_len(&self) -> usize {
        wire::cmsg_space(size_of::<wire::DmabufCmsg>()) * self.control_descriptors
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn completion_deadline(&self) -> Duration {
        Duration::from_millis(self.completion_deadline_ms)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Number of connections to accept and drain.
    pub iterations: usize,
    pub validate: bool,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local address to bind before connecting, selecting the egress NIC.
    pub bind: Option<SocketAddr>,
    pub peer: SocketAddr,
    /// Number of connections, each sending the whole source region once.
    pub iterations: usize,
    /// Bytes per zero-copy send; defaults to the whole region.
    pub chunk_size: Option<usize>,
    /// Interface the zero-copy socket is bound to.
    pub interface: Option<String>,
    pub engine: EngineConfig,
}
