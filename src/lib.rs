//! # Stampede
//!
//! Stampede is a load generation engine. It simulates many concurrent virtual
//! users, each repeatedly performing a fixed sequence of actions against a target,
//! while recording the outcome of every action.
//!
//! A load test is described by a [`WorkloadDefinition`](workload/struct.WorkloadDefinition.html):
//! how many virtual users to run, how many iterations they share, how long to run,
//! and which actions make up one iteration. Definitions are plain data, so they're
//! equally easy to build in Rust or to deserialize from JSON.
//!
//! Stampede uses [`reqwest`](https://docs.rs/reqwest/) to perform requests by default.
//! Any other protocol can be load tested by implementing the
//! [`Transport`](transport/trait.Transport.html) trait.
//!
//! ## Creating and running a Stampede load test
//!
//! Add the following boilerplate `use` declaration at the top of your `src/main.rs`:
//!
//! ```rust
//! use stampede::prelude::*;
//! ```
//!
//! Then define a workload and execute it:
//!
//! ```rust,no_run
//! use stampede::prelude::*;
//!
//! fn main() -> Result<(), StampedeError> {
//!     let summary = LoadTest::initialize(
//!         WorkloadDefinition::new(10, 1_000)
//!             .set_think_time("1", "3")
//!             .register_action(
//!                 ActionDefinition::get("http://localhost:8080/")
//!                     .register_check(CheckDefinition::status("status is 200", 200)),
//!             )
//!             .register_action(
//!                 ActionDefinition::post("http://localhost:8080/login")
//!                     .register_check(CheckDefinition::success("logged in")),
//!             ),
//!     )?
//!     .execute()?;
//!
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```
//!
//! [`LoadTest::initialize`] parses run-time options from the command line, so the
//! compiled load test can be tuned without rebuilding it:
//!
//! ```bash
//! $ cargo run --release -- --users 100 --run-time 5m --startup-time 30s -v
//! ```
//!
//! The load test stops when any of the following happens:
//!  - every virtual user stopped, because the shared iteration budget is exhausted
//!  - the configured run time elapsed
//!  - the [`StopSignal`](shutdown/struct.StopSignal.html) returned by
//!    [`LoadTest::stop_signal`] was raised
//!  - ctrl-c was pressed
//!
//! In every case virtual users finish the iteration they're working on before
//! exiting, and the returned [`RunSummary`](metrics/struct.RunSummary.html) contains
//! the outcome of every action that was performed.
//!
//! ## License
//!
//! Licensed under the Apache License, Version 2.0 (the "License");
//! you may not use this file except in compliance with the License.
//! You may obtain a copy of the License at
//!
//! <http://www.apache.org/licenses/LICENSE-2.0>
//!
//! Unless required by applicable law or agreed to in writing, software
//! distributed under the License is distributed on an "AS IS" BASIS,
//! WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//! See the License for the specific language governing permissions and
//! limitations under the License.

#[macro_use]
extern crate log;

pub mod config;
pub mod logger;
pub mod metrics;
pub mod prelude;
pub mod scheduler;
pub mod shutdown;
pub mod transport;
pub mod user;
pub mod util;
pub mod workload;

use chrono::prelude::*;
use gumdrop::Options;
use std::sync::Arc;
use std::{fmt, io, time};
use tokio::runtime::Runtime;

use crate::config::StampedeConfiguration;
use crate::metrics::{OutcomeRecorder, RunSummary};
use crate::scheduler::RunHandle;
use crate::shutdown::StopSignal;
use crate::transport::{ReqwestTransport, Transport};
use crate::workload::{Workload, WorkloadDefinition};

/// How often the run controller checks whether the load test should stop.
const MONITOR_INTERVAL: time::Duration = time::Duration::from_millis(50);

/// Definition of all errors a [`LoadTest`] can return.
#[derive(Debug)]
pub enum StampedeError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a ['tokio::task::JoinError'](https://tokio-rs.github.io/tokio/doc/tokio/task/struct.JoinError.html).
    TokioJoin(tokio::task::JoinError),
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Failed to parse an action's URL.
    InvalidUrl {
        /// The invalid URL that caused this error.
        url: String,
        /// An optional explanation of the error.
        detail: String,
        /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
        parse_error: url::ParseError,
    },
    /// A check can't be evaluated as defined.
    InvalidCheck {
        /// Name of the invalid check.
        name: String,
        /// An optional explanation of the error.
        detail: String,
    },
}
/// Implement a helper to provide a text description of all possible types of errors.
impl StampedeError {
    fn describe(&self) -> &str {
        match *self {
            StampedeError::Io(_) => "io::Error",
            StampedeError::Reqwest(_) => "reqwest::Error",
            StampedeError::TokioJoin(_) => "tokio::task::JoinError",
            StampedeError::InvalidOption { .. } => "invalid option or value specified",
            StampedeError::InvalidUrl { .. } => "failed to parse url",
            StampedeError::InvalidCheck { .. } => "invalid check specified",
        }
    }

    /// Returns `true` if the error was caused by an invalid workload or option,
    /// in which case no virtual user was launched.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            StampedeError::InvalidOption { .. }
                | StampedeError::InvalidUrl { .. }
                | StampedeError::InvalidCheck { .. }
        )
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for StampedeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            StampedeError::Io(ref source) => {
                write!(f, "StampedeError: {} ({})", self.describe(), source)
            }
            StampedeError::Reqwest(ref source) => {
                write!(f, "StampedeError: {} ({})", self.describe(), source)
            }
            StampedeError::TokioJoin(ref source) => {
                write!(f, "StampedeError: {} ({})", self.describe(), source)
            }
            StampedeError::InvalidOption {
                ref option,
                ref value,
                ref detail,
            } => write!(
                f,
                "StampedeError: {} ({}={}: {})",
                self.describe(),
                option,
                value,
                detail
            ),
            StampedeError::InvalidUrl {
                ref url,
                ref parse_error,
                ..
            } => write!(
                f,
                "StampedeError: {} ({}: {})",
                self.describe(),
                url,
                parse_error
            ),
            StampedeError::InvalidCheck {
                ref name,
                ref detail,
            } => write!(f, "StampedeError: {} ({}: {})", self.describe(), name, detail),
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for StampedeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            StampedeError::Io(ref source) => Some(source),
            StampedeError::Reqwest(ref source) => Some(source),
            StampedeError::TokioJoin(ref source) => Some(source),
            StampedeError::InvalidUrl {
                ref parse_error, ..
            } => Some(parse_error),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for StampedeError {
    fn from(err: reqwest::Error) -> StampedeError {
        StampedeError::Reqwest(err)
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for StampedeError {
    fn from(err: io::Error) -> StampedeError {
        StampedeError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for StampedeError {
    fn from(err: tokio::task::JoinError) -> StampedeError {
        StampedeError::TokioJoin(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// A [`LoadTest`] moves through each of the following phases during a complete
/// load test.
pub enum RunPhase {
    /// The load test has not started.
    Idle,
    /// Virtual users are launching and beginning to generate load.
    Starting,
    /// All virtual users have launched and are generating load.
    Running,
    /// Virtual users are finishing their current iteration and stopping.
    Stopping,
    /// Exiting the load test.
    Shutdown,
}

/// Why the run controller stopped the load test.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StopReason {
    Finished,
    RunTime,
    Canceled,
    CtrlC,
}
impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let reason = match self {
            StopReason::Finished => "all users stopped",
            StopReason::RunTime => "run time elapsed",
            StopReason::Canceled => "stop signal raised",
            StopReason::CtrlC => "caught ctrl-c",
        };
        write!(f, "{}", reason)
    }
}

/// A configured load test, ready to run.
pub struct LoadTest {
    workload: Arc<Workload>,
    configuration: StampedeConfiguration,
    transport: Option<Arc<dyn Transport>>,
    stop: StopSignal,
    phase: RunPhase,
}
impl LoadTest {
    /// Load configuration from the command line, apply it to the workload
    /// definition and initialize the Stampede logger.
    ///
    /// Exits the process if the command line can't be parsed.
    pub fn initialize(definition: WorkloadDefinition) -> Result<LoadTest, StampedeError> {
        let configuration = StampedeConfiguration::parse_args_default_or_exit();
        configuration.initialize_logger();
        LoadTest::initialize_with_config(definition, configuration)
    }

    /// Apply an already loaded configuration to the workload definition.
    ///
    /// This doesn't initialize the Stampede logger.
    pub fn initialize_with_config(
        definition: WorkloadDefinition,
        configuration: StampedeConfiguration,
    ) -> Result<LoadTest, StampedeError> {
        configuration.validate()?;
        let workload = Workload::try_from(configuration.apply(definition))?;
        Ok(LoadTest::new(workload).set_configuration(configuration))
    }

    /// Run a validated workload with the default configuration.
    pub fn new(workload: Workload) -> LoadTest {
        LoadTest {
            workload: Arc::new(workload),
            configuration: StampedeConfiguration::default(),
            transport: None,
            stop: StopSignal::new(),
            phase: RunPhase::Idle,
        }
    }

    /// Validate a workload definition and run it with the default configuration.
    ///
    /// # Example
    /// ```rust
    /// use stampede::prelude::*;
    ///
    /// let error = LoadTest::from_definition(
    ///     WorkloadDefinition::new(-1, 10)
    ///         .register_action(ActionDefinition::get("http://localhost/")),
    /// )
    /// .err()
    /// .unwrap();
    /// assert!(error.is_configuration());
    /// ```
    pub fn from_definition(definition: WorkloadDefinition) -> Result<LoadTest, StampedeError> {
        Ok(LoadTest::new(Workload::try_from(definition)?))
    }

    pub fn set_configuration(mut self, configuration: StampedeConfiguration) -> Self {
        self.configuration = configuration;
        self
    }

    /// Replace the default [`ReqwestTransport`].
    pub fn set_transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// A handle that stops the load test when raised, from any thread.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    /// Run the load test to completion on a new tokio runtime.
    pub fn execute(self) -> Result<RunSummary, StampedeError> {
        let rt = Runtime::new()?;
        rt.block_on(self.run())
    }

    /// Run the load test to completion on the current tokio runtime.
    ///
    /// Returns an error only if the load test can't start. Failed actions are
    /// reported in the returned [`RunSummary`].
    pub async fn run(mut self) -> Result<RunSummary, StampedeError> {
        let transport: Arc<dyn Transport> = match self.transport.take() {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::with_timeout(
                self.configuration.request_timeout()?,
            )?),
        };
        let (logger_handle, logger_tx) = self.configuration.setup_outcome_log().await?;

        let ctrlc = if self.configuration.no_ctrlc {
            None
        } else {
            Some(util::watch_ctrlc())
        };
        if self.workload.is_unbounded() {
            warn!("no iteration or run time limit, load test runs until stopped");
        }

        let recorder = Arc::new(OutcomeRecorder::new());
        let started = time::Instant::now();
        let started_at = Local::now();
        self.set_phase(RunPhase::Starting);
        let handle = scheduler::start(
            self.workload.clone(),
            transport,
            recorder.clone(),
            self.stop.clone(),
            logger_tx.clone(),
        );

        let reason = self.monitor(&handle, started, ctrlc.as_ref()).await;
        info!("stopping load test: {}", reason);
        self.set_phase(RunPhase::Stopping);
        self.stop.stop();
        let launched = handle.launched();
        let users = handle.drain().await;
        if users.len() < launched {
            warn!("{} of {} users exited abnormally", launched - users.len(), launched);
        }
        let mut summary = recorder.finalize();

        // Tell the logger task to flush and exit.
        if let Some(logger) = logger_tx {
            if let Err(e) = logger.send(None) {
                warn!("failed to stop outcome log: {}", e);
            }
        }
        if let Some(logger_handle) = logger_handle {
            match logger_handle.await {
                Ok(Ok(())) => (),
                Ok(Err(e)) => warn!("outcome log failed: {}", e),
                Err(e) => warn!("outcome log exited abnormally: {}", e),
            }
        }

        summary.users = launched;
        summary.started = Some(started_at);
        summary.stopped = Some(Local::now());
        summary.duration = started.elapsed();
        self.set_phase(RunPhase::Shutdown);
        info!(
            "{} users completed {} iterations, {} of {} actions failed",
            util::format_number(summary.users),
            util::format_number(summary.iterations),
            util::format_number(summary.failed),
            util::format_number(summary.attempted),
        );
        Ok(summary)
    }

    fn set_phase(&mut self, phase: RunPhase) {
        // There's nothing to do if already in the specified phase.
        if self.phase == phase {
            return;
        }
        info!("entering load test phase: {:?}", &phase);
        self.phase = phase;
    }

    // Poll until something ends the load test.
    async fn monitor(
        &mut self,
        handle: &RunHandle,
        started: time::Instant,
        ctrlc: Option<&util::SignalWatch>,
    ) -> StopReason {
        let mut drift = tokio::time::Instant::now();
        loop {
            if self.stop.is_stopped() {
                return StopReason::Canceled;
            }
            if ctrlc.is_some_and(|watch| watch.is_stopped()) {
                return StopReason::CtrlC;
            }
            if let Some(run_time) = self.workload.duration() {
                if util::ms_timer_expired(started, run_time.as_millis() as usize) {
                    return StopReason::RunTime;
                }
            }
            if handle.finished() {
                return StopReason::Finished;
            }
            if self.phase == RunPhase::Starting && !handle.ramping() {
                info!("launched {} users", util::format_number(handle.launched()));
                self.set_phase(RunPhase::Running);
            }

            tokio::select! {
                next = util::sleep_minus_drift(MONITOR_INTERVAL, drift) => drift = next,
                _ = self.stop.stopped() => (),
            }
        }
    }
}
