//! Cooperative shutdown plumbing.
//!
//! A `()` broadcast fans the signal out to every task; each task holds a
//! clone of a completion `mpsc::Sender` that it drops on exit, so the
//! orchestrator can wait for all of them by receiving until the channel
//! closes.

use tokio::sync::{broadcast, mpsc};

/// Listens for the shutdown signal. Checked at every suspension point of a
/// long-running task.
#[derive(Debug)]
pub struct Shutdown {
    /// `true` once the signal has been received.
    is_shutdown: bool,
    notify:      broadcast::Receiver<()>,
    /// Dropped on task exit; the handle waits on the paired receiver.
    _complete:   mpsc::Sender<()>,
}

impl Shutdown {
    pub fn is_shutdown(&self) -> bool { self.is_shutdown }

    /// Wait for the shutdown signal. Returns immediately if it was already
    /// received.
    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        // lagging is fine; any result means the signal fired
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

/// Owner side: hands out `Shutdown` listeners and triggers the signal.
#[derive(Debug)]
pub struct ShutdownHandle {
    notify:      broadcast::Sender<()>,
    complete_tx: mpsc::Sender<()>,
    complete_rx: mpsc::Receiver<()>,
}

impl Default for ShutdownHandle {
    fn default() -> Self { Self::new() }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        let (complete_tx, complete_rx) = mpsc::channel(1);
        Self {
            notify,
            complete_tx,
            complete_rx,
        }
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify:      self.notify.subscribe(),
            _complete:   self.complete_tx.clone(),
        }
    }

    /// Signal every listener and wait until each one has dropped its
    /// completion sender.
    pub async fn shutdown(mut self) {
        let _ = self.notify.send(());
        drop(self.complete_tx);
        let _ = self.complete_rx.recv().await;
    }
}
