use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{op} failed: {source}")]
    Socket {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("region overrun: offset {offset} + length {len} exceeds capacity {capacity}")]
    RegionOverrun {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("memory provider error: {0}")]
    Memory(String),

    #[error("malformed control message: {0}")]
    Malformed(String),

    #[error("control data truncated (buffer of {capacity} bytes)")]
    ControlTruncated { capacity: usize },

    #[error("token release mismatch: requested {requested}, kernel released {released}")]
    TokenRelease { requested: usize, released: usize },

    #[error("no fragment matched dmabuf id {expected} in {batches} consecutive batches")]
    ForeignRegion { expected: u32, batches: usize },

    #[error("send {sequence} is still awaiting completion")]
    SendInFlight { sequence: u32 },

    #[error("completion for send {sequence} not received within {waited_ms}ms")]
    CompletionTimeout { sequence: u32, waited_ms: u64 },

    #[error("completion for send {sequence} failed: origin {origin}, errno {errno}")]
    CompletionFailed {
        sequence: u32,
        origin: u8,
        errno: u32,
    },

    #[error("completion range {lo}..={hi} does not cover send {sequence}")]
    CompletionMismatch { sequence: u32, lo: u32, hi: u32 },

    #[error("invalid session transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::transport::SessionState,
        to: crate::transport::SessionState,
    },

    #[error("netlink {op} failed: {reason}")]
    Netlink { op: &'static str, reason: String },

    #[error("validation failed: {mismatches} mismatching bytes (first at offset {first})")]
    Validation { mismatches: usize, first: usize },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Wrap the current `errno` as a failure of the named socket call.
    pub fn last_os(op: &'static str) -> Self {
        Self::Socket {
            op,
            source: io::Error::last_os_error(),
        }
    }

    pub fn netlink(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Netlink {
            op,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_error_names_operation() {
        let e = Error::Socket {
            op: "recvmsg",
            source: io::Error::from_raw_os_error(libc::ECONNRESET),
        };
        assert!(e.to_string().starts_with("recvmsg failed: "));
    }

    #[test]
    fn test_socket_error_keeps_option_name_readable() {
        let e = Error::Socket {
            op: "setsockopt(SO_REUSEPORT)",
            source: io::Error::from_raw_os_error(libc::EINVAL),
        };
        let message = e.to_string();
        assert!(message.starts_with("setsockopt(SO_REUSEPORT) failed: "), "{message}");
        assert!(!message.contains(")()"));
    }

    #[test]
    fn test_token_release_display() {
        let e = Error::TokenRelease {
            requested: 3,
            released: 2,
        };
        assert_eq!(
            e.to_string(),
            "token release mismatch: requested 3, kernel released 2"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::AddrInUse, "port busy");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("port busy"));
    }
}
