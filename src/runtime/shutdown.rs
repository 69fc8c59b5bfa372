//! Cancellation signal shared by the listener and its sessions.

use tokio::sync::watch;

/// Owning side of the shutdown signal.
///
/// Dropping it (or firing it, in tests) cancels every subscribed `Shutdown`.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Hand out a receiver for one task.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            is_shutdown: *self.tx.borrow(),
            notify: self.tx.subscribe(),
        }
    }

    /// Cancel all subscribers.
    #[cfg(test)]
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: watch::Receiver<bool>,
}

impl Shutdown {
    #[cfg(test)]
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Wait until shutdown is signalled. Returns immediately once it has been.
    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }

        // Err means the trigger is gone, which also cancels.
        let _ = self.notify.wait_for(|stop| *stop).await;
        self.is_shutdown = true;
    }
}
