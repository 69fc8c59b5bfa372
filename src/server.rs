//! TCP listener for the echo server.
//!
//! Accepts incoming connections in a loop and hands each one to a new,
//! independently spawned session. The listener keeps no reference to the
//! sessions it spawns.

use crate::config::Config;
use crate::runtime::{bind_with_retry, ListenerError, SessionGuard, Shutdown};
use crate::session::{Session, SessionSettings};
use std::any::Any;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{error, info};

/// Pause after a failed accept so a persistent error (e.g. `EMFILE`) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Source of accepted connections.
pub trait Acceptor: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    type Stream = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// Listener instance
pub struct Listener<A> {
    acceptor: A,
    runtime: Handle,
    settings: SessionSettings,
    connection_limit: Option<Arc<Semaphore>>,
    shutdown: Shutdown,
    drain: mpsc::Sender<()>,
    next_id: u64,
}

impl<A: Acceptor> Listener<A> {
    /// Create a listener that spawns its sessions onto `runtime`.
    pub fn new(
        acceptor: A,
        runtime: Handle,
        settings: SessionSettings,
        max_connections: Option<usize>,
        shutdown: Shutdown,
        drain: mpsc::Sender<()>,
    ) -> Self {
        Listener {
            acceptor,
            runtime,
            settings,
            connection_limit: max_connections.map(|n| Arc::new(Semaphore::new(n))),
            shutdown,
            drain,
            next_id: 0,
        }
    }

    /// Accept connections until shutdown is signalled.
    ///
    /// Accept errors are logged and do not stop the loop.
    pub async fn run(mut self) {
        loop {
            // Wait for a connection slot
            let permit = match self.connection_limit.clone() {
                Some(limit) => tokio::select! {
                    permit = limit.acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(e) => {
                            error!(error = %e, "Connection limit closed");
                            break;
                        }
                    },
                    _ = self.shutdown.recv() => break,
                },
                None => None,
            };

            let accepted = tokio::select! {
                res = self.acceptor.accept() => res,
                _ = self.shutdown.recv() => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    self.next_id += 1;
                    info!(session = self.next_id, peer = %peer, "Accepted connection");
                    self.dispatch(stream, peer, permit);
                }
                Err(e) => {
                    error!(error = %e, "Error accepting connection");
                    tokio::select! {
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                        _ = self.shutdown.recv() => break,
                    }
                }
            }
        }

        info!("TCP listener finished");
    }

    /// Move `stream` into a new session task.
    fn dispatch(&self, stream: A::Stream, peer: SocketAddr, permit: Option<OwnedSemaphorePermit>) {
        let guard = SessionGuard::new(self.next_id, peer, permit, self.drain.clone());
        let session = Session::new(stream, self.settings, self.shutdown.clone(), guard);
        supervise(&self.runtime, self.next_id, peer, session.run());
    }
}

/// Spawn `task` and log it if it panics.
///
/// The panic stays inside the task; the caller gets nothing back to join.
pub fn supervise<F>(runtime: &Handle, session: u64, peer: SocketAddr, task: F)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let handle = runtime.spawn(task);
    runtime.spawn(async move {
        if let Err(e) = handle.await {
            if e.is_panic() {
                let payload = e.into_panic();
                error!(
                    session,
                    peer = %peer,
                    panic = panic_message(payload.as_ref()),
                    "Session terminated with panic"
                );
            }
        }
    });
}

/// Text of a panic payload, if it carries one.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// Bind the configured address and serve until shutdown.
///
/// Returns once the listener has stopped and every session it spawned has
/// finished. A listening socket failure is returned without starting the loop.
pub async fn serve(config: &Config, runtime: Handle, shutdown: Shutdown) -> Result<(), ListenerError> {
    let listener = bind_with_retry(config.listen, config.backlog, config.bind).await?;

    let (drain_tx, mut drain_rx) = mpsc::channel::<()>(1);
    Listener::new(
        listener,
        runtime,
        SessionSettings::from(config),
        config.max_connections,
        shutdown,
        drain_tx,
    )
    .run()
    .await;

    // Every session holds a sender; recv yields None once all are gone.
    let _ = drain_rx.recv().await;
    Ok(())
}
