//! Cooperative stop signals and first-writer-wins fault capture.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{watch, Notify};

use crate::SessionError;

/// Owning side of a stop signal
#[derive(Debug)]
pub(crate) struct StopTrigger {
    tx: watch::Sender<bool>,
}

/// Observing side of a stop signal
#[derive(Debug, Clone)]
pub(crate) struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopTrigger {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Raise the signal; idempotent
    pub(crate) fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl StopSignal {
    pub(crate) fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal is raised or its trigger is dropped
    pub(crate) async fn wait(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleep for `duration`; returns true if stopped meanwhile
    pub(crate) async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.wait() => true,
            _ = tokio::time::sleep(duration) => self.is_set(),
        }
    }
}

/// Holds the first fault reported on a connection
#[derive(Debug, Default)]
pub(crate) struct FaultSlot {
    fault: Mutex<Option<SessionError>>,
    raised: Notify,
}

impl FaultSlot {
    /// Record a fault unless one is already recorded; returns whether this one won
    pub(crate) fn report(&self, err: SessionError) -> bool {
        let mut slot = match self.fault.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(err);
        drop(slot);
        self.raised.notify_one();
        true
    }

    /// Resolve once a fault has been reported
    pub(crate) async fn raised(&self) {
        self.raised.notified().await
    }

    pub(crate) fn take(&self) -> Option<SessionError> {
        match self.fault.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}
