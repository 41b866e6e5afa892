//! In-flight counter for candidate handlers.
//!
//! The probe may only report completion once every handler that started has
//! finished; [`DrainBarrier::wait_until_zero`] is the authoritative check.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct DrainBarrier {
    in_flight: AtomicUsize,
    zero: Notify,
}

impl DrainBarrier {
    pub fn new() -> Self {
        DrainBarrier {
            in_flight: AtomicUsize::new(0),
            zero: Notify::new(),
        }
    }

    pub fn increment(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the counter. A decrement at zero is refused and logged.
    pub fn decrement(&self) {
        match self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => self.zero.notify_waiters(),
            Ok(_) => {}
            Err(_) => log::error!("drain barrier decremented below zero"),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Increments now and decrements when the returned guard drops.
    pub fn enter(&self) -> DrainGuard<'_> {
        self.increment();
        DrainGuard { barrier: self }
    }

    /// Resolves once no handler is in flight.
    pub async fn wait_until_zero(&self) {
        loop {
            let notified = self.zero.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent last decrement is not missed.
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Keeps one handler counted in its [`DrainBarrier`] for as long as it lives.
pub struct DrainGuard<'a> {
    barrier: &'a DrainBarrier,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.barrier.decrement();
    }
}
