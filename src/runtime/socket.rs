//! Listening socket setup.
//!
//! Opens the socket through socket2 so `SO_REUSEADDR` is set before bind,
//! then hands it to tokio.

use crate::config::BindPolicy;
use crate::runtime::backoff::calculate_backoff;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Error type for listening socket setup. All variants are fatal to the listener.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to create the socket.
    Open(io::Error),
    /// Failed to bind to address.
    Bind(SocketAddr, io::Error),
    /// Failed to start listening.
    Listen(SocketAddr, io::Error),
}

impl ListenerError {
    pub fn io_error(&self) -> &io::Error {
        match self {
            ListenerError::Open(e) | ListenerError::Bind(_, e) | ListenerError::Listen(_, e) => e,
        }
    }
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Open(e) => write!(f, "Failed to open listening socket: {}", e),
            ListenerError::Bind(addr, e) => write!(f, "Failed to bind to {}: {}", addr, e),
            ListenerError::Listen(addr, e) => write!(f, "Failed to listen on {}: {}", addr, e),
        }
    }
}

impl std::error::Error for ListenerError {}

/// Create a non-blocking TCP listener with `SO_REUSEADDR`.
///
/// A failure to set the reuse option is logged and ignored; every other
/// step is fatal. Must be called from within the runtime.
pub fn create_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener, ListenerError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(ListenerError::Open)?;

    if let Err(e) = socket.set_reuse_address(true) {
        warn!(error = %e, "Error setting reuse_address");
    }

    socket.set_nonblocking(true).map_err(ListenerError::Open)?;
    socket
        .bind(&addr.into())
        .map_err(|e| ListenerError::Bind(addr, e))?;
    socket
        .listen(backlog)
        .map_err(|e| ListenerError::Listen(addr, e))?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(|e| ListenerError::Listen(addr, e))
}

/// Bind the listening socket, retrying up to `policy.retries` extra times.
pub async fn bind_with_retry(
    addr: SocketAddr,
    backlog: i32,
    policy: BindPolicy,
) -> Result<TcpListener, ListenerError> {
    let mut attempt = 0;
    loop {
        match create_listener(addr, backlog) {
            Ok(listener) => {
                let local = listener.local_addr().unwrap_or(addr);
                info!(address = %local, "TCP server listening");
                return Ok(listener);
            }
            Err(e) if attempt < policy.retries => {
                attempt += 1;
                let delay = calculate_backoff(attempt, policy.backoff_ms, policy.backoff_max_ms);
                warn!(
                    error = %e,
                    attempt,
                    retries = policy.retries,
                    delay_ms = delay.as_millis() as u64,
                    "Bind failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(error = %e, "Listening socket setup failed");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::SockRef;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_listener_has_reuse_address() {
        let listener = create_listener(loopback(), 16).unwrap();
        assert!(SockRef::from(&listener).reuse_address().unwrap());
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let taken = create_listener(loopback(), 16).unwrap();
        let addr = taken.local_addr().unwrap();

        let err = bind_with_retry(addr, 16, BindPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ListenerError::Bind(a, _) if a == addr));
        assert_eq!(err.io_error().kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_retry_is_bounded() {
        let taken = create_listener(loopback(), 16).unwrap();
        let addr = taken.local_addr().unwrap();

        let policy = BindPolicy {
            retries: 3,
            backoff_ms: 10,
            backoff_max_ms: 20,
        };
        let started = tokio::time::Instant::now();
        let result = bind_with_retry(addr, 16, policy).await;

        assert!(matches!(result, Err(ListenerError::Bind(..))));
        // 10 + 20 + 20 ms of backoff across three retries.
        assert!(started.elapsed() >= std::time::Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_retry_succeeds_once_released() {
        let taken = create_listener(loopback(), 16).unwrap();
        let addr = taken.local_addr().unwrap();

        let policy = BindPolicy {
            retries: 5,
            backoff_ms: 100,
            backoff_max_ms: 100,
        };
        let binding = tokio::spawn(bind_with_retry(addr, 16, policy));

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        drop(taken);

        let listener = binding.await.unwrap().unwrap();
        assert_eq!(listener.local_addr().unwrap(), addr);
    }
}
