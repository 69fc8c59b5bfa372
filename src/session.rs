//! Per-connection echo session.
//!
//! A session owns one accepted stream and echoes every chunk it reads back
//! to the same peer, in order, until the peer closes, an I/O error occurs,
//! a configured timeout expires, or shutdown is signalled.
//!
//! There is no framing: each read of up to `buffer_size` bytes is written
//! back verbatim before the next read starts.

use crate::config::Config;
use crate::runtime::{ConnState, Op, SessionEnd, SessionGuard, Shutdown};
use bytes::BytesMut;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::error::Elapsed;
use tracing::{info, trace};

/// Per-session tunables, copied into every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub buffer_size: usize,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            buffer_size: 128,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            buffer_size: config.buffer_size,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        }
    }
}

/// One echo session. Consumed by `run`.
pub struct Session<S> {
    stream: S,
    state: ConnState,
    buffer: BytesMut,
    settings: SessionSettings,
    shutdown: Shutdown,
    guard: SessionGuard,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, settings: SessionSettings, shutdown: Shutdown, guard: SessionGuard) -> Self {
        Self {
            stream,
            state: ConnState::Connected,
            buffer: BytesMut::zeroed(settings.buffer_size),
            settings,
            shutdown,
            guard,
        }
    }

    /// Echo until the session ends, log how it ended, and release the stream.
    pub async fn run(mut self) -> SessionEnd {
        let end = self.echo_loop().await;
        self.state.close();
        end.log(self.guard.id(), self.guard.peer());
        end
    }

    async fn echo_loop(&mut self) -> SessionEnd {
        let id = self.guard.id();
        let peer = self.guard.peer();

        loop {
            self.state.start_reading();
            trace!(session = id, state = ?self.state, "Session state");

            let read = tokio::select! {
                biased;
                _ = self.shutdown.recv() => return SessionEnd::Aborted,
                res = with_timeout(self.settings.read_timeout, self.stream.read(&mut self.buffer[..])) => res,
            };

            let n = match read {
                Ok(Ok(0)) => return SessionEnd::PeerClosed,
                Ok(Ok(n)) => n,
                Ok(Err(error)) => return SessionEnd::Failed { op: Op::Read, error },
                Err(_) => return SessionEnd::TimedOut { op: Op::Read },
            };
            info!(session = id, peer = %peer, bytes = n, "Received");

            self.state.start_writing(n);
            trace!(session = id, state = ?self.state, "Session state");

            let written = tokio::select! {
                biased;
                _ = self.shutdown.recv() => return SessionEnd::Aborted,
                res = with_timeout(self.settings.write_timeout, self.stream.write_all(&self.buffer[..n])) => res,
            };

            match written {
                Ok(Ok(())) => {}
                Ok(Err(error)) => return SessionEnd::Failed { op: Op::Write, error },
                Err(_) => return SessionEnd::TimedOut { op: Op::Write },
            }
            info!(session = id, peer = %peer, bytes = n, "Sent");
        }
    }
}

/// Bound `fut` by `limit`. Only an expired `limit` yields `Elapsed`.
async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> Result<io::Result<T>, Elapsed>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await,
        None => Ok(fut.await),
    }
}
