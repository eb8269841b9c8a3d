//! Cooperative stop signal shared by the run controller and every virtual user.
//!
//! A [`StopSignal`] is cheap to clone; all clones observe the same flag. Virtual
//! users poll it at the top of each iteration and never abandon a request that is
//! already in flight. Duration expiry, external cancellation and ctrl-c all raise
//! the same signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct StopState {
    stopped: AtomicBool,
    notify: Notify,
}

/// Thread-safe cancellation token.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    state: Arc<StopState>,
}

impl StopSignal {
    /// Create a new, un-raised stop signal.
    pub fn new() -> Self {
        StopSignal::default()
    }

    /// Raise the signal. Idempotent.
    pub fn stop(&self) {
        if !self.state.stopped.swap(true, Ordering::SeqCst) {
            debug!("stop signal raised");
        }
        self.state.notify.notify_waiters();
    }

    /// Point in time check if the signal has been raised.
    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::SeqCst)
    }

    /// Lower the signal so the token can be reused by another run.
    pub(crate) fn reset(&self) {
        self.state.stopped.store(false, Ordering::SeqCst);
    }

    /// Wait until the signal is raised. Safe to race against other futures.
    pub async fn stopped(&self) {
        loop {
            // Register interest before checking the flag so a concurrent `stop()`
            // can't slip between the check and the wait.
            let notified = self.state.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}
