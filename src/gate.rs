//! Completion-vs-timeout race.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::mpsc;

/// Result of waiting on a [`CompletionGate`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GateOutcome {
    Completed,
    TimedOut,
}

/// Sending half of the completion channel. Cloneable; fires at most once across all clones.
#[derive(Clone, Debug)]
pub struct CompletionSignal {
    tx: mpsc::Sender<()>,
    fired: Arc<AtomicBool>,
}

impl CompletionSignal {
    /// Pushes the signal. Returns false if it was already pushed.
    ///
    /// Never blocks: the channel has one slot and only the first call sends.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.tx.try_send(()).is_err() {
            // Gate already dropped, the session is over.
            log::debug!("completion signal fired after the gate closed");
        }
        true
    }
}

/// Receiving half of the completion channel.
#[derive(Debug)]
pub struct CompletionGate {
    rx: mpsc::Receiver<()>,
}

impl CompletionGate {
    /// Creates a connected signal/gate pair.
    pub fn channel() -> (CompletionSignal, CompletionGate) {
        let (tx, rx) = mpsc::channel(1);
        (
            CompletionSignal {
                tx,
                fired: Arc::new(AtomicBool::new(false)),
            },
            CompletionGate { rx },
        )
    }

    /// Waits for the completion signal for at most `timeout`.
    ///
    /// If every signal is dropped without firing, completion can no longer
    /// happen and the gate runs out the timeout.
    pub async fn wait(&mut self, timeout: Duration) -> GateOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        match tokio::time::timeout_at(deadline, self.rx.recv()).await {
            Ok(Some(())) => GateOutcome::Completed,
            Ok(None) => {
                log::debug!("completion signal dropped without firing");
                tokio::time::sleep_until(deadline).await;
                GateOutcome::TimedOut
            }
            Err(_) => GateOutcome::TimedOut,
        }
    }

    /// Stops accepting signals. Later `fire` calls are absorbed.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
