//! Cancelable single-shot timer.
//!
//! Arming replaces any pending instance, so at most one callback is ever
//! scheduled per timer.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct OneShotTimer {
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl OneShotTimer {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule `fire` after `delay`, cancelling whatever was pending.
    ///
    /// Returns false (and schedules nothing) outside a tokio runtime.
    pub fn arm<F>(&self, delay: Duration, fire: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!("No tokio runtime; timer not armed");
                self.cancel();
                return false;
            }
        };

        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            fire();
        });

        if let Some(previous) = self.slot().replace(handle) {
            previous.abort();
        }
        true
    }

    pub fn cancel(&self) {
        if let Some(previous) = self.slot().take() {
            previous.abort();
        }
    }

    /// Forget the pending instance without cancelling it. Used from inside a
    /// firing callback so that dropping the timer does not abort that callback.
    pub fn disarm(&self) {
        self.slot().take();
    }

    /// True while a callback is scheduled and has not run yet.
    pub fn is_armed(&self) -> bool {
        self.slot().as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
