use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::bail;
use tokio::sync::oneshot;


/// A one-shot hand-over between a platform callback and the task that waits for it.
///
/// The waiting side arms the rendezvous *before* starting the platform operation, so a callback
///  that fires immediately is not lost. Signalling without a waiter (e.g. a late callback after
///  cancellation) is a no-op.
pub struct Rendezvous<T> {
    waiter: Mutex<Option<oneshot::Sender<T>>>,
}
impl<T> Default for Rendezvous<T> {
    fn default() -> Self {
        Rendezvous {
            waiter: Mutex::new(None),
        }
    }
}

impl<T> Rendezvous<T> {
    pub fn new() -> Rendezvous<T> {
        Rendezvous::default()
    }

    /// Register for the next signal. Only one wait can be outstanding at a time.
    pub fn arm(&self) -> anyhow::Result<oneshot::Receiver<T>> {
        let mut waiter = self.lock();
        if waiter.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false) {
            bail!("a wait is already outstanding");
        }
        let (tx, rx) = oneshot::channel();
        *waiter = Some(tx);
        Ok(rx)
    }

    /// returns `true` if there was a waiter to hand `value` to
    pub fn signal(&self, value: T) -> bool {
        match self.lock().take() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Drop the outstanding registration, waking the waiter with an error.
    pub fn disarm(&self) {
        self.lock().take();
    }

    fn lock(&self) -> MutexGuard<'_, Option<oneshot::Sender<T>>> {
        self.waiter.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
