//! Launching virtual users, and the iteration budget they share.
//!
//! [`start`] spawns one tokio task per virtual user, either all at once or spaced
//! evenly across the ramp-up window, and returns a [`RunHandle`] used to observe
//! and finally drain them.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time;
use tokio::task::JoinHandle;

use crate::logger::OutcomeLogTx;
use crate::metrics::OutcomeRecorder;
use crate::shutdown::StopSignal;
use crate::transport::Transport;
use crate::user::{self, UserContext, VirtualUser};
use crate::util;
use crate::workload::{RampPolicy, Workload};

/// Total number of iterations all virtual users may start, shared between them.
///
/// Claiming is a single atomic decrement-if-positive, so no matter how many users
/// race for the last iteration exactly one of them wins it.
#[derive(Debug)]
pub struct IterationBudget {
    remaining: AtomicUsize,
    limited: bool,
    claimed: AtomicUsize,
}
impl IterationBudget {
    /// A budget of `total` iterations. A budget of 0 is unlimited.
    pub fn new(total: usize) -> Self {
        IterationBudget {
            remaining: AtomicUsize::new(total),
            limited: total > 0,
            claimed: AtomicUsize::new(0),
        }
    }

    /// Try to claim one iteration. Returns `false` once the budget is exhausted.
    pub fn claim(&self) -> bool {
        if self.limited
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                    remaining.checked_sub(1)
                })
                .is_err()
        {
            return false;
        }
        self.claimed.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Iterations left to claim, or `None` if unlimited.
    pub fn remaining(&self) -> Option<usize> {
        if self.limited {
            Some(self.remaining.load(Ordering::SeqCst))
        } else {
            None
        }
    }

    /// How many iterations have been claimed so far.
    pub fn claimed(&self) -> usize {
        self.claimed.load(Ordering::SeqCst)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == Some(0)
    }
}

// Counts a virtual user as active until dropped.
struct ActiveUser(Arc<AtomicUsize>);
impl Drop for ActiveUser {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Observe and drain the virtual users of a running load test.
pub struct RunHandle {
    budget: Arc<IterationBudget>,
    launched: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    ramping: Arc<AtomicBool>,
    ramp: JoinHandle<Vec<JoinHandle<VirtualUser>>>,
}
impl RunHandle {
    /// How many virtual users have been launched.
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    /// How many launched virtual users have not yet stopped.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Returns `true` while virtual users are still being launched.
    pub fn ramping(&self) -> bool {
        self.ramping.load(Ordering::SeqCst)
    }

    /// Returns `true` once ramping is over and every launched virtual user stopped.
    pub fn finished(&self) -> bool {
        !self.ramping() && self.active() == 0
    }

    pub fn budget(&self) -> &IterationBudget {
        &self.budget
    }

    /// Wait for ramping to end and every virtual user to stop, returning the
    /// stopped users ordered by index.
    ///
    /// Raise the stop signal first unless the users are expected to run out of
    /// iterations on their own.
    pub async fn drain(self) -> Vec<VirtualUser> {
        let handles = match self.ramp.await {
            Ok(handles) => handles,
            Err(e) => {
                error!("failed to launch users: {}", e);
                Vec::new()
            }
        };
        let mut users = Vec::with_capacity(handles.len());
        for result in futures::future::join_all(handles).await {
            match result {
                Ok(user) => users.push(user),
                Err(e) => error!("virtual user exited abnormally: {}", e),
            }
        }
        users.sort_by_key(|user| user.index);
        users
    }
}

/// Launch the workload's virtual users. Must be called from within a tokio runtime.
///
/// Ramping ends early, launching no further users, once the stop signal is raised
/// or the iteration budget is exhausted.
pub fn start(
    workload: Arc<Workload>,
    transport: Arc<dyn Transport>,
    recorder: Arc<OutcomeRecorder>,
    stop: StopSignal,
    outcome_log: OutcomeLogTx,
) -> RunHandle {
    let budget = Arc::new(IterationBudget::new(workload.iterations()));
    let launched = Arc::new(AtomicUsize::new(0));
    let active = Arc::new(AtomicUsize::new(0));
    let ramping = Arc::new(AtomicBool::new(workload.concurrency() > 0));

    let context = UserContext {
        workload,
        transport,
        budget: budget.clone(),
        recorder,
        stop,
        outcome_log,
        started: time::Instant::now(),
    };
    let ramp = tokio::spawn(launch_users(
        context,
        launched.clone(),
        active.clone(),
        ramping.clone(),
    ));

    RunHandle {
        budget,
        launched,
        active,
        ramping,
        ramp,
    }
}

async fn launch_users(
    context: UserContext,
    launched: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    ramping: Arc<AtomicBool>,
) -> Vec<JoinHandle<VirtualUser>> {
    let concurrency = context.workload.concurrency();
    let spacing = match context.workload.ramp() {
        RampPolicy::Linear(window) if concurrency > 1 => {
            let spacing = window.div_f64(concurrency as f64);
            info!(
                "launching {} users over {:?}, one every {:?}",
                concurrency, window, spacing
            );
            Some(spacing)
        }
        _ => {
            info!("launching {} users", concurrency);
            None
        }
    };

    let mut handles = Vec::with_capacity(concurrency);
    let mut drift = tokio::time::Instant::now();
    for index in 1..=concurrency {
        if context.stop.is_stopped() {
            info!("stop signal raised after launching {} users", index - 1);
            break;
        }
        if context.budget.is_exhausted() {
            info!("iteration budget exhausted after launching {} users", index - 1);
            break;
        }

        active.fetch_add(1, Ordering::SeqCst);
        launched.fetch_add(1, Ordering::SeqCst);
        let user_context = context.clone();
        let user_active = ActiveUser(active.clone());
        handles.push(tokio::spawn(async move {
            // Dropped when the task ends, even if the user panics.
            let _active = user_active;
            user::run(VirtualUser::new(index), user_context).await
        }));

        if let Some(spacing) = spacing {
            if index < concurrency {
                tokio::select! {
                    next = util::sleep_minus_drift(spacing, drift) => drift = next,
                    _ = context.stop.stopped() => (),
                }
            }
        }
    }

    ramping.store(false, Ordering::SeqCst);
    debug!("done launching {} users", launched.load(Ordering::SeqCst));
    handles
}
