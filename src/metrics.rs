//! Outcomes collected and aggregated during load tests.
//!
//! Every action a virtual user performs produces exactly one [`Outcome`]. Outcomes
//! are submitted to the shared [`OutcomeRecorder`], which folds them into a
//! [`RunSummary`]. When [`LoadTest::run`](../struct.LoadTest.html#method.run)
//! completes it returns the final, frozen `RunSummary`.
//!
//! When the [`RunSummary`] is viewed with [`std::fmt::Display`], the per-action
//! metrics, response time percentiles, checks and errors are displayed in tables.

use chrono::prelude::*;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::{fmt, time};

use crate::util;
use crate::workload::Method;

/// Why an action failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionFailure {
    /// The transport could not complete the request.
    Transport(String),
    /// The request completed, but the named checks did not pass.
    Checks(Vec<String>),
}
impl fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ActionFailure::Transport(detail) => write!(f, "{}", detail),
            ActionFailure::Checks(names) => write!(f, "failed checks: {}", names.join(", ")),
        }
    }
}

/// Whether a single named check passed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
}

/// The immutable record of one completed action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// How many milliseconds the load test had been running when the action started.
    pub elapsed: u64,
    /// Which virtual user performed the action.
    pub user: usize,
    /// Which of this user's iterations the action belongs to, starting at 1.
    pub iteration: usize,
    /// Position of the action within the workload.
    pub action_index: usize,
    /// Name of the action.
    pub name: String,
    /// Method used for the request.
    pub method: Method,
    /// How long the action took, in milliseconds.
    pub response_time: u64,
    /// Status code, if a response was received.
    pub status: Option<u16>,
    /// `true` if a response was received and every check passed.
    pub success: bool,
    /// Failure detail when `success` is `false`.
    pub failure: Option<ActionFailure>,
    /// Per-check results, in the order the checks are defined.
    pub checks: Vec<CheckResult>,
}
impl Outcome {
    pub(crate) fn new(
        elapsed: u128,
        user: usize,
        iteration: usize,
        action_index: usize,
        name: &str,
        method: Method,
    ) -> Self {
        Outcome {
            elapsed: elapsed as u64,
            user,
            iteration,
            action_index,
            name: name.to_string(),
            method,
            response_time: 0,
            status: None,
            success: true,
            failure: None,
            checks: Vec::new(),
        }
    }

    pub(crate) fn set_response_time(&mut self, response_time: time::Duration) {
        self.response_time = response_time.as_millis() as u64;
    }

    /// Record the status code and check results of a completed request.
    pub(crate) fn set_response(&mut self, status: u16, checks: Vec<CheckResult>) {
        self.status = Some(status);
        let failed: Vec<String> = checks
            .iter()
            .filter(|check| !check.passed)
            .map(|check| check.name.clone())
            .collect();
        if !failed.is_empty() {
            self.success = false;
            self.failure = Some(ActionFailure::Checks(failed));
        }
        self.checks = checks;
    }

    /// Record a request that never produced a response. Every check counts as failed.
    pub(crate) fn set_transport_failure(&mut self, detail: &str, checks: Vec<CheckResult>) {
        self.success = false;
        self.failure = Some(ActionFailure::Transport(detail.to_string()));
        self.checks = checks;
    }
}

/// Response time distribution and counters for a group of outcomes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyAggregate {
    /// Per-response-time counters, tracking how often actions completed in a given time.
    ///
    /// Response times under 100ms are stored without rounding. Response times between
    /// 100 and 500ms are rounded to the nearest 10ms, between 500 and 1000ms to the
    /// nearest 100ms, and larger response times to the nearest 1000ms.
    pub response_times: BTreeMap<usize, usize>,
    /// The shortest response time seen so far, not rounded.
    pub min_response_time: usize,
    /// The longest response time seen so far, not rounded.
    pub max_response_time: usize,
    /// Total combined response times seen so far.
    pub total_response_time: usize,
    /// How many response times have been recorded.
    pub counter: usize,
    /// How many outcomes succeeded.
    pub success_count: usize,
    /// How many outcomes failed.
    pub fail_count: usize,
    /// Per-status-code counters.
    pub status_code_counts: BTreeMap<u16, usize>,
}
impl LatencyAggregate {
    /// Fold one outcome into the aggregate.
    pub(crate) fn record(&mut self, outcome: &Outcome) {
        self.set_response_time(outcome.response_time);
        if outcome.success {
            self.success_count += 1;
        } else {
            self.fail_count += 1;
        }
        if let Some(status) = outcome.status {
            *self.status_code_counts.entry(status).or_insert(0) += 1;
        }
    }

    fn set_response_time(&mut self, response_time: u64) {
        let response_time_usize = response_time as usize;

        if self.counter == 0 || response_time_usize < self.min_response_time {
            self.min_response_time = response_time_usize;
        }
        if response_time_usize > self.max_response_time {
            self.max_response_time = response_time_usize;
        }
        self.total_response_time += response_time_usize;
        self.counter += 1;

        // Round the response time so similar times share a counter.
        let rounded_response_time = if response_time < 100 {
            response_time_usize
        } else if response_time < 500 {
            ((response_time as f64 / 10.0).round() * 10.0) as usize
        } else if response_time < 1000 {
            ((response_time as f64 / 100.0).round() * 100.0) as usize
        } else {
            ((response_time as f64 / 1000.0).round() * 1000.0) as usize
        };
        *self.response_times.entry(rounded_response_time).or_insert(0) += 1;
    }

    /// Average response time in milliseconds.
    pub fn average(&self) -> f32 {
        if self.counter == 0 {
            0.0
        } else {
            self.total_response_time as f32 / self.counter as f32
        }
    }

    /// The response time that `percent` of outcomes completed within, ie `0.95`.
    ///
    /// Values are clamped to the observed minimum and maximum, as stored times are
    /// rounded.
    pub fn percentile(&self, percent: f32) -> usize {
        let percentile_request = (self.counter as f32 * percent).round() as usize;
        let mut total_count: usize = 0;
        for (value, counter) in &self.response_times {
            total_count += counter;
            if total_count >= percentile_request {
                return (*value).clamp(self.min_response_time, self.max_response_time);
            }
        }
        0
    }
}

/// Pass and fail counts for one named check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckTally {
    pub passes: usize,
    pub fails: usize,
}

/// Aggregated results of a load test.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// How many virtual users were launched.
    pub users: usize,
    /// How many iterations were completed.
    pub iterations: usize,
    /// How many outcomes were recorded.
    pub attempted: usize,
    /// How many outcomes failed, either in transport or a check.
    pub failed: usize,
    /// Distribution across all actions.
    pub latency: LatencyAggregate,
    /// Distribution per action name.
    pub actions: BTreeMap<String, LatencyAggregate>,
    /// Results per check name.
    pub checks: BTreeMap<String, CheckTally>,
    /// Failure details and how often each occurred.
    pub errors: BTreeMap<String, usize>,
    /// When the load test started.
    pub started: Option<DateTime<Local>>,
    /// When the load test finished draining.
    pub stopped: Option<DateTime<Local>>,
    /// How long the load test ran.
    pub duration: time::Duration,
    /// Set once the summary is frozen at the end of the load test.
    pub final_summary: bool,
}
impl RunSummary {
    fn record(&mut self, outcome: &Outcome) {
        self.attempted += 1;
        if !outcome.success {
            self.failed += 1;
        }
        self.latency.record(outcome);
        self.actions
            .entry(outcome.name.clone())
            .or_default()
            .record(outcome);
        for check in &outcome.checks {
            let tally = self.checks.entry(check.name.clone()).or_default();
            if check.passed {
                tally.passes += 1;
            } else {
                tally.fails += 1;
            }
        }
        if let Some(failure) = &outcome.failure {
            *self
                .errors
                .entry(format!("{}: {}", outcome.name, failure))
                .or_insert(0) += 1;
        }
    }

    /// Outcomes and failures per second over the run's duration.
    pub fn per_second(&self) -> (f32, f32) {
        let seconds = self.duration.as_secs_f32();
        if seconds == 0.0 {
            (0.0, 0.0)
        } else {
            (
                self.attempted as f32 / seconds,
                self.failed as f32 / seconds,
            )
        }
    }

    fn fmt_actions(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>10} | {:>14} | {:>7} | {:>6} | {:>6}",
            "Name", "# attempts", "# fails", "avg ms", "min", "max"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        let rows = self
            .actions
            .iter()
            .map(|(name, aggregate)| (name.as_str(), aggregate))
            .chain(if self.actions.len() > 1 {
                Some(("Aggregated", &self.latency))
            } else {
                None
            });
        for (name, aggregate) in rows {
            let fail_percent = if aggregate.counter > 0 {
                aggregate.fail_count as f32 / aggregate.counter as f32 * 100.0
            } else {
                0.0
            };
            writeln!(
                fmt,
                " {:<24} | {:>10} | {:>14} | {:>7.2} | {:>6} | {:>6}",
                util::truncate_string(name, 24),
                util::format_number(aggregate.counter),
                format!(
                    "{} ({:.1}%)",
                    util::format_number(aggregate.fail_count),
                    fail_percent
                ),
                aggregate.average(),
                util::format_number(aggregate.min_response_time),
                util::format_number(aggregate.max_response_time),
            )?;
        }
        Ok(())
    }

    fn fmt_percentiles(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>6} | {:>6} | {:>6} | {:>6} | {:>6} | {:>6}",
            "Name", "50%", "75%", "90%", "95%", "99%", "99.9%"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (name, aggregate) in &self.actions {
            let p = |percent| util::format_number(aggregate.percentile(percent));
            writeln!(
                fmt,
                " {:<24} | {:>6} | {:>6} | {:>6} | {:>6} | {:>6} | {:>6}",
                util::truncate_string(name, 24),
                p(0.5),
                p(0.75),
                p(0.9),
                p(0.95),
                p(0.99),
                p(0.999),
            )?;
        }
        Ok(())
    }

    fn fmt_checks(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.checks.is_empty() {
            return Ok(());
        }
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(fmt, " {:<40} | {:>15} | {:>15}", "Check", "passes", "fails")?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (name, tally) in &self.checks {
            writeln!(
                fmt,
                " {:<40} | {:>15} | {:>15}",
                util::truncate_string(name, 40),
                util::format_number(tally.passes),
                util::format_number(tally.fails),
            )?;
        }
        Ok(())
    }

    fn fmt_errors(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return Ok(());
        }
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(fmt, " {:<11} | Error", "Count")?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        // Most frequent errors first.
        for (error, count) in self.errors.iter().sorted_by(|a, b| b.1.cmp(a.1)) {
            writeln!(fmt, " {:<11} | {}", util::format_number(*count), error)?;
        }
        Ok(())
    }
}
impl fmt::Display for RunSummary {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (attempts_per_second, fails_per_second) = self.per_second();
        writeln!(
            fmt,
            "\n === {} ===",
            if self.final_summary {
                "FINAL SUMMARY"
            } else {
                "RUNNING SUMMARY"
            }
        )?;
        writeln!(
            fmt,
            " users: {} | iterations: {} | attempted: {} | failed: {} | duration: {:.2}s",
            util::format_number(self.users),
            util::format_number(self.iterations),
            util::format_number(self.attempted),
            util::format_number(self.failed),
            self.duration.as_secs_f32(),
        )?;
        writeln!(
            fmt,
            " attempts/s: {:.2} | fails/s: {:.2}",
            attempts_per_second, fails_per_second
        )?;
        if self.attempted == 0 {
            return Ok(());
        }
        self.fmt_actions(fmt)?;
        self.fmt_percentiles(fmt)?;
        self.fmt_checks(fmt)?;
        self.fmt_errors(fmt)
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    summary: RunSummary,
    sealed: bool,
}

/// Thread-safe accumulator shared by every virtual user.
///
/// Each call to [`record`](OutcomeRecorder::record) applies all of an outcome's
/// effects under one lock, so a concurrent [`snapshot`](OutcomeRecorder::snapshot)
/// never sees a partial update.
#[derive(Debug, Default)]
pub struct OutcomeRecorder {
    state: Mutex<RecorderState>,
}
impl OutcomeRecorder {
    pub fn new() -> Self {
        OutcomeRecorder::default()
    }

    // A panicking virtual user can't leave the summary half-updated, so a
    // poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fold an outcome into the summary. Returns `false` if the recorder is sealed
    /// and the outcome was discarded.
    pub fn record(&self, outcome: &Outcome) -> bool {
        let mut state = self.lock();
        if state.sealed {
            return false;
        }
        state.summary.record(outcome);
        true
    }

    /// Count one fully completed iteration.
    pub fn record_iteration(&self) -> bool {
        let mut state = self.lock();
        if state.sealed {
            return false;
        }
        state.summary.iterations += 1;
        true
    }

    /// A consistent point-in-time copy of the summary.
    pub fn snapshot(&self) -> RunSummary {
        self.lock().summary.clone()
    }

    /// Reject all further writes.
    pub fn seal(&self) {
        self.lock().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    /// Seal the recorder and return the frozen summary.
    pub fn finalize(&self) -> RunSummary {
        let mut state = self.lock();
        state.sealed = true;
        let mut summary = state.summary.clone();
        summary.final_summary = true;
        summary
    }
}
