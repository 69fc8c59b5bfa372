//! Execution context and connection plumbing.
//!
//! - `build`: the single tokio runtime every task is multiplexed onto
//! - `socket`: listening socket setup with `SO_REUSEADDR` and bind retry
//! - `connection`: session state machine and lifetime guard
//! - `shutdown`: cancellation signal for the listener and its sessions

mod backoff;
pub mod connection;
pub mod shutdown;
pub mod socket;

pub(crate) use connection::{ConnState, Op, SessionEnd, SessionGuard};
pub(crate) use shutdown::{Shutdown, ShutdownTrigger};
pub(crate) use socket::{bind_with_retry, ListenerError};

use std::io;
use tokio::runtime::{Builder, Runtime};

/// Build the shared I/O execution context.
///
/// Unset or one worker gives a current-thread runtime: all sessions are
/// cooperatively scheduled on the calling thread. More workers give a
/// multi-thread runtime; per-session ordering is the same either way.
pub fn build(workers: Option<usize>) -> io::Result<Runtime> {
    match workers {
        None | Some(0) | Some(1) => Builder::new_current_thread().enable_all().build(),
        Some(n) => Builder::new_multi_thread()
            .worker_threads(n)
            .thread_name("echo-worker")
            .enable_all()
            .build(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_runtimes() {
        let rt = build(None).unwrap();
        assert_eq!(rt.block_on(async { 1 + 1 }), 2);

        let rt = build(Some(2)).unwrap();
        let handle = rt.handle().clone();
        let joined = rt.block_on(async move { handle.spawn(async { 40 + 2 }).await });
        assert_eq!(joined.unwrap(), 42);
    }
}
