//! Session state machine and lifetime tracking.
//!
//! Each session tracks its current state (reading, writing, closed) and
//! holds a guard that releases its connection slot when dropped.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::{debug, error, info, warn};

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Ownership of the stream just moved into the session.
    Connected,
    /// Waiting for the peer to send data.
    Reading,
    /// Echoing a received chunk back.
    Writing {
        /// Bytes in the chunk being echoed.
        len: usize,
    },
    /// Terminal state.
    Closed,
}

impl ConnState {
    /// Transition to reading state.
    pub fn start_reading(&mut self) {
        debug_assert!(!matches!(self, ConnState::Closed), "read after close");
        *self = ConnState::Reading;
    }

    /// Transition to writing state.
    pub fn start_writing(&mut self, len: usize) {
        debug_assert!(matches!(self, ConnState::Reading), "write without read");
        *self = ConnState::Writing { len };
    }

    /// Mark session closed.
    pub fn close(&mut self) {
        *self = ConnState::Closed;
    }
}

/// I/O direction that ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Read => f.write_str("read"),
            Op::Write => f.write_str("write"),
        }
    }
}

/// Why a session reached `Closed`.
#[derive(Debug)]
pub enum SessionEnd {
    /// Peer shut down its write side.
    PeerClosed,
    /// Shutdown was signalled while the session was waiting on I/O.
    Aborted,
    /// A configured read or write timeout expired.
    TimedOut { op: Op },
    /// Any I/O failure, including an OS-level `ETIMEDOUT`.
    Failed { op: Op, error: io::Error },
}

impl SessionEnd {
    /// Emit the diagnostic line for this outcome.
    pub fn log(&self, session: u64, peer: SocketAddr) {
        match self {
            SessionEnd::PeerClosed => info!(session, peer = %peer, "Connection closed by peer"),
            SessionEnd::Aborted => info!(session, peer = %peer, "Session aborted"),
            SessionEnd::TimedOut { op } => {
                warn!(session, peer = %peer, op = %op, "Session timed out")
            }
            SessionEnd::Failed { op, error } => {
                error!(session, peer = %peer, op = %op, error = %error, "Session I/O error")
            }
        }
    }
}

/// Resources bound to a session's lifetime.
///
/// Dropping the guard returns the connection slot (if a ceiling is
/// configured) and the drain token. Runs on every exit path, unwinding
/// included.
#[derive(Debug)]
pub struct SessionGuard {
    id: u64,
    peer: SocketAddr,
    _permit: Option<OwnedSemaphorePermit>,
    _drain: mpsc::Sender<()>,
}

impl SessionGuard {
    pub fn new(
        id: u64,
        peer: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
        drain: mpsc::Sender<()>,
    ) -> Self {
        Self {
            id,
            peer,
            _permit: permit,
            _drain: drain,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        debug!(session = self.id, peer = %self.peer, "Session finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_state_transitions() {
        let mut state = ConnState::Connected;

        state.start_reading();
        assert_eq!(state, ConnState::Reading);

        state.start_writing(4);
        assert_eq!(state, ConnState::Writing { len: 4 });

        state.start_reading();
        assert_eq!(state, ConnState::Reading);

        state.close();
        assert_eq!(state, ConnState::Closed);
    }

    #[tokio::test]
    async fn test_guard_releases_slot_and_drain() {
        let limit = Arc::new(Semaphore::new(1));
        let (drain_tx, mut drain_rx) = mpsc::channel::<()>(1);

        let permit = limit.clone().try_acquire_owned().unwrap();
        let guard = SessionGuard::new(7, peer(), Some(permit), drain_tx);
        assert_eq!(guard.id(), 7);
        assert_eq!(limit.available_permits(), 0);

        drop(guard);
        assert_eq!(limit.available_permits(), 1);
        assert!(drain_rx.recv().await.is_none());
    }
}
