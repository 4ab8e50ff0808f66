//! Per-connection orchestration of the plain TCP and zero-copy paths.

mod client;
mod server;

pub use client::{run_client, transmit_tcp, transmit_zerocopy};
pub use server::{
    Retained, devmem_ring_size, receive_devmem, receive_tcp, run_server, serve, validate_received,
};

use crate::error::{Error, Result};
use tracing::trace;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    Tcp,
    Zerocopy,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    Setup,
    Established,
    StreamingTcp,
    StreamingZerocopy,
    Closed,
}

/// Receive path of a server.
pub enum RxMode<'a, R> {
    Tcp,
    /// Payload lands in `source`, bound to the NIC queues as `dmabuf_id`.
    Devmem { source: &'a R, dmabuf_id: u32 },
}

impl<R> RxMode<'_, R> {
    pub fn mode(&self) -> Mode {
        match self {
            RxMode::Tcp => Mode::Tcp,
            RxMode::Devmem { .. } => Mode::Zerocopy,
        }
    }
}

/// Transmit path of a client.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TxMode {
    Tcp,
    Devmem { dmabuf_id: u32 },
}

impl TxMode {
    pub fn mode(&self) -> Mode {
        match self {
            TxMode::Tcp => Mode::Tcp,
            TxMode::Devmem { .. } => Mode::Zerocopy,
        }
    }
}

/// Lifecycle of one connection. The streaming state is fixed by the mode
/// chosen at construction; any state but `Closed` may close.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    mode: Mode,
}

impl Session {
    pub fn new(mode: Mode) -> Self {
        Self {
            state: SessionState::Setup,
            mode,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn establish(&mut self) -> Result<()> {
        self.transition(SessionState::Established)
    }

    pub fn stream(&mut self) -> Result<()> {
        self.transition(match self.mode {
            Mode::Tcp => SessionState::StreamingTcp,
            Mode::Zerocopy => SessionState::StreamingZerocopy,
        })
    }

    pub fn close(&mut self) -> Result<()> {
        self.transition(SessionState::Closed)
    }

    fn transition(&mut self, to: SessionState) -> Result<()> {
        use SessionState::*;

        let allowed = match (self.state, to) {
            (Setup, Established) => true,
            (Established, StreamingTcp) => self.mode == Mode::Tcp,
            (Established, StreamingZerocopy) => self.mode == Mode::Zerocopy,
            (Closed, _) => false,
            (_, Closed) => true,
            _ => false,
        };
        if !allowed {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }
        trace!(from = ?self.state, ?to, "Session transition");
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zerocopy_lifecycle() {
        let mut session = Session::new(Mode::Zerocopy);
        session.establish().unwrap();
        session.stream().unwrap();
        assert_eq!(session.state(), SessionState::StreamingZerocopy);
        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_mode_cannot_change_mid_session() {
        let mut session = Session::new(Mode::Tcp);
        session.establish().unwrap();
        assert!(matches!(
            session.transition(SessionState::StreamingZerocopy),
            Err(Error::InvalidTransition {
                from: SessionState::Established,
                to: SessionState::StreamingZerocopy
            })
        ));
        session.stream().unwrap();
        assert_eq!(session.state(), SessionState::StreamingTcp);
    }

    #[test]
    fn test_cannot_stream_before_established() {
        let mut session = Session::new(Mode::Tcp);
        assert!(session.stream().is_err());
        session.close().unwrap();
    }

    #[test]
    fn test_closed_is_final() {
        let mut session = Session::new(Mode::Zerocopy);
        session.close().unwrap();
        assert!(session.establish().is_err());
        assert!(session.close().is_err());
    }
}
