//! Signalling shutdown to the tasks of a dtq server.
//!
//! A [ShutdownManager] flips a shared flag exactly once; every [ShutdownReceiver] observes it,
//! including receivers created after the flag was flipped.

use tokio::sync::watch;

#[derive(Debug)]
pub struct ShutdownManager {
    tx: watch::Sender<bool>,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }
}

impl ShutdownManager {
    pub fn new_pair() -> (Self, ShutdownReceiver) {
        let manager = Self::default();
        let receiver = manager.add_receiver();
        (manager, receiver)
    }

    pub fn add_receiver(&self) -> ShutdownReceiver {
        ShutdownReceiver {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    /// Tells all receivers to shut down. Returns whether this call was the one that did so.
    pub fn shutdown_immediately(&self) -> bool {
        !self.tx.send_replace(true)
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownReceiver {
    rx: watch::Receiver<bool>,
}

impl ShutdownReceiver {
    /// Resolves once shutdown was requested, or the manager was dropped.
    /// Cancel-safe, so it can be raced in a `select!`.
    pub async fn recv_shutdown_immediately(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }
}
