//! Virtual users, and the loop each one runs until the load test ends.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{self, Duration};

use crate::logger::OutcomeLogTx;
use crate::metrics::{CheckResult, Outcome, OutcomeRecorder};
use crate::scheduler::IterationBudget;
use crate::shutdown::StopSignal;
use crate::transport::Transport;
use crate::workload::{Action, Workload};

/// Lifecycle of a [`VirtualUser`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserState {
    Idle,
    Running,
    Stopped,
}

/// One simulated client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualUser {
    /// Unique index of this user, starting at 1.
    pub index: usize,
    /// How many iterations this user has started.
    pub iterations: usize,
    pub state: UserState,
}
impl VirtualUser {
    pub fn new(index: usize) -> Self {
        VirtualUser {
            index,
            iterations: 0,
            state: UserState::Idle,
        }
    }
}

/// Everything a virtual user shares with the rest of the load test.
#[derive(Clone)]
pub struct UserContext {
    pub workload: Arc<Workload>,
    pub transport: Arc<dyn Transport>,
    /// Iterations are only started after successfully claiming one from the budget.
    pub budget: Arc<IterationBudget>,
    pub recorder: Arc<OutcomeRecorder>,
    pub stop: StopSignal,
    /// Optional channel to the outcome log.
    pub outcome_log: OutcomeLogTx,
    /// When the load test started, used to timestamp outcomes.
    pub started: time::Instant,
}

/// Run a virtual user until the stop signal is raised or the iteration budget is
/// exhausted, then return it in the [`UserState::Stopped`] state.
///
/// The stop signal is only checked between iterations and while thinking: once an
/// iteration starts, every action in it is performed and recorded.
pub async fn run(mut user: VirtualUser, context: UserContext) -> VirtualUser {
    info!("launching user {}...", user.index);
    user.state = UserState::Running;

    'iterations: loop {
        if context.stop.is_stopped() {
            debug!("user {}: stop signal raised", user.index);
            break;
        }
        if !context.budget.claim() {
            debug!("user {}: iteration budget exhausted", user.index);
            break;
        }
        user.iterations += 1;

        for (action_index, action) in context.workload.actions().iter().enumerate() {
            debug!(
                "user {}: iteration {} performing {}",
                user.index, user.iterations, action.name
            );
            let outcome = perform_action(&user, action_index, action, &context).await;
            if let Some(logger) = context.outcome_log.as_ref() {
                if let Err(e) = logger.send(Some(outcome.clone())) {
                    warn!("user {}: failed to write to outcome log: {}", user.index, e);
                }
            }
            if !context.recorder.record(&outcome) {
                warn!(
                    "user {}: outcome of {} discarded after results were finalized",
                    user.index, action.name
                );
            }
        }
        context.recorder.record_iteration();

        // If think time is defined, wait a random time before the next iteration.
        if let Some((min, max)) = context.workload.think_time() {
            let mut wait_time = rand::rng().random_range(min..=max).as_millis();
            // Never sleep more than 500 milliseconds, so a thinking user notices
            // quickly when the load test stops.
            let maximum_sleep_time = 500;

            while wait_time > 0 {
                if context.stop.is_stopped() {
                    break 'iterations;
                }
                let sleep_duration = if wait_time > maximum_sleep_time {
                    wait_time -= maximum_sleep_time;
                    Duration::from_millis(maximum_sleep_time as u64)
                } else {
                    let sleep_duration = Duration::from_millis(wait_time as u64);
                    wait_time = 0;
                    sleep_duration
                };
                trace!("user {} sleeping {:?} ...", user.index, sleep_duration);
                tokio::time::sleep(sleep_duration).await;
            }
        }
    }

    user.state = UserState::Stopped;
    info!(
        "exiting user {} after {} iterations...",
        user.index, user.iterations
    );
    user
}

// Perform one action through the transport and evaluate its checks.
async fn perform_action(
    user: &VirtualUser,
    action_index: usize,
    action: &Action,
    context: &UserContext,
) -> Outcome {
    let mut outcome = Outcome::new(
        context.started.elapsed().as_millis(),
        user.index,
        user.iterations,
        action_index,
        &action.name,
        action.method,
    );
    let started = time::Instant::now();
    let result = context.transport.execute(action.method, &action.url).await;
    outcome.set_response_time(started.elapsed());

    match result {
        Ok(response) => {
            let checks = action
                .checks
                .iter()
                .map(|check| CheckResult {
                    name: check.name.clone(),
                    passed: check.evaluate(&response),
                })
                .collect();
            outcome.set_response(response.status, checks);
        }
        Err(e) => {
            debug!("user {}: {} failed: {}", user.index, action.name, e);
            let checks = action
                .checks
                .iter()
                .map(|check| CheckResult {
                    name: check.name.clone(),
                    passed: false,
                })
                .collect();
            outcome.set_transport_failure(&e.detail, checks);
        }
    }
    outcome
}
