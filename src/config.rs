//! Functions and structures related to configuring a Stampede load test.
//!
//! Stampede can be configured at run time by passing in the options and flags defined
//! by the [`StampedeConfiguration`] structure. Options that are set override the
//! matching fields of the [`WorkloadDefinition`] being run.

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::path::PathBuf;
use std::time;

use crate::logger::LogFormat;
use crate::util;
use crate::workload::WorkloadDefinition;
use crate::StampedeError;

/// Runtime options available when launching a Stampede load test.
///
/// Stampede leverages [`gumdrop`](https://docs.rs/gumdrop/) to derive help from the
/// below structure.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Stampede generates load by running many virtual users, each repeatedly
performing a sequence of actions against a target.

The following runtime options are available when launching a Stampede load test:"#
)]
pub struct StampedeConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,

    /// Sets concurrent virtual users
    #[options(short = "u")]
    pub users: Option<usize>,
    /// Sets total iterations shared by all users (0 is unlimited)
    #[options(short = "i")]
    pub iterations: Option<usize>,
    /// Launches users over (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "s", meta = "TIME")]
    pub startup_time: String,
    /// Stops load test after (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "t", meta = "TIME")]
    pub run_time: String,
    /// Sets per-request timeout (30s, 20m, 3h, 1h30m, etc)
    #[options(no_short, meta = "TIME")]
    pub timeout: String,
    /// Enables Stampede log file and sets name
    #[options(short = "G", meta = "NAME")]
    pub log_file: String,
    /// Increases Stampede log level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases Stampede verbosity (-q, -qq, etc)
    #[options(count, short = "q", help = "Decreases Stampede verbosity (-q, -qq, etc)")]
    pub quiet: u8,
    /// Increases Stampede verbosity (-v, -vv, etc)
    #[options(
        count,
        short = "v",
        // Add a blank line and then an 'Outcomes:' header after this option
        help = "Increases Stampede verbosity (-v, -vv, etc)\n\nOutcomes:"
    )]
    pub verbose: u8,

    /// Sets outcome log file name
    #[options(short = "O", meta = "NAME")]
    pub outcome_log: String,
    /// Sets outcome log format (csv, json, raw, pretty)
    #[options(
        no_short,
        meta = "FORMAT",
        help = "Sets outcome log format (csv, json, raw, pretty)\n\nAdvanced:"
    )]
    pub outcome_format: Option<LogFormat>,

    /// Doesn't stop the load test on ctrl-c
    #[options(no_short)]
    pub no_ctrlc: bool,
}

// Parse a time span option, returning `None` when it's unset or zero.
fn timespan_option(option: &str, value: &str) -> Result<Option<time::Duration>, StampedeError> {
    if value.is_empty() {
        return Ok(None);
    }
    match util::parse_duration(value) {
        Some(duration) if duration.as_secs() == 0 => Ok(None),
        Some(duration) => Ok(Some(duration)),
        None => Err(StampedeError::InvalidOption {
            option: option.to_string(),
            value: value.to_string(),
            detail: format!(
                "{} must be a time span such as 30, 30s, 20m, 3h or 1h30m.",
                option
            ),
        }),
    }
}

impl StampedeConfiguration {
    /// Validate the run-time options before anything is launched.
    pub fn validate(&self) -> Result<(), StampedeError> {
        timespan_option("--startup-time", &self.startup_time)?;
        timespan_option("--run-time", &self.run_time)?;
        timespan_option("--timeout", &self.timeout)?;

        if self.outcome_format.is_some() && self.outcome_log.is_empty() {
            return Err(StampedeError::InvalidOption {
                option: "--outcome-format".to_string(),
                value: format!("{:?}", self.outcome_format),
                detail: "--outcome-format can not be set without also setting --outcome-log."
                    .to_string(),
            });
        }

        Ok(())
    }

    /// Overlay the options that are set onto a workload definition.
    pub fn apply(&self, mut definition: WorkloadDefinition) -> WorkloadDefinition {
        if let Some(users) = self.users {
            debug!("--users overrides concurrency: {}", users);
            definition.concurrency = users as i64;
        }
        if let Some(iterations) = self.iterations {
            debug!("--iterations overrides iterations: {}", iterations);
            definition.iterations = iterations as i64;
        }
        if !self.run_time.is_empty() {
            definition.duration = Some(self.run_time.clone());
        }
        if !self.startup_time.is_empty() {
            definition.ramp_up = Some(self.startup_time.clone());
        }
        definition
    }

    /// The per-request timeout, if one is configured.
    pub fn request_timeout(&self) -> Result<Option<time::Duration>, StampedeError> {
        timespan_option("--timeout", &self.timeout)
    }

    /// Optionally initialize the Stampede logger which writes to standard out and/or
    /// to a configurable log file.
    pub fn initialize_logger(&self) {
        // Configure debug output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure log file level.
        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        let log_file: Option<PathBuf> = if !self.log_file.is_empty() {
            Some(PathBuf::from(&self.log_file))
        } else {
            None
        };

        let mut loggers: Vec<Box<dyn SharedLogger>> =
            vec![SimpleLogger::new(debug_level, Config::default())];
        if let Some(log_to_file) = log_file.as_ref() {
            match std::fs::File::create(log_to_file) {
                Ok(file) => loggers.push(WriteLogger::new(log_level, Config::default(), file)),
                Err(e) => eprintln!(
                    "failed to create log file {}: {}",
                    log_to_file.display(),
                    e
                ),
            }
        }
        if let Err(e) = CombinedLogger::init(loggers) {
            info!("failed to initialize CombinedLogger: {}", e);
        }
        if let Some(log_to_file) = log_file {
            info!("Writing to log file: {}", log_to_file.display());
        }

        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::workload::ActionDefinition;

    fn definition() -> WorkloadDefinition {
        WorkloadDefinition::new(2, 10).register_action(ActionDefinition::get("http://localhost/"))
    }

    #[test]
    fn parse_options() {
        let configuration = StampedeConfiguration::parse_args_default(&[
            "-u",
            "5",
            "--iterations",
            "20",
            "--run-time",
            "1m",
            "-s",
            "10s",
            "--outcome-log",
            "outcomes.csv",
            "--outcome-format",
            "csv",
            "-vv",
            "--no-ctrlc",
        ])
        .unwrap();
        assert_eq!(configuration.users, Some(5));
        assert_eq!(configuration.iterations, Some(20));
        assert_eq!(configuration.run_time, "1m");
        assert_eq!(configuration.startup_time, "10s");
        assert_eq!(configuration.outcome_log, "outcomes.csv");
        assert_eq!(configuration.outcome_format, Some(LogFormat::Csv));
        assert_eq!(configuration.verbose, 2);
        assert!(configuration.no_ctrlc);
        assert!(configuration.validate().is_ok());

        assert!(StampedeConfiguration::parse_args_default(&["--outcome-format", "xml"]).is_err());
    }

    #[test]
    fn apply_overrides_set_options() {
        let unchanged = StampedeConfiguration::default().apply(definition());
        assert_eq!(unchanged.concurrency, 2);
        assert_eq!(unchanged.iterations, 10);
        assert_eq!(unchanged.duration, None);
        assert_eq!(unchanged.ramp_up, None);

        let configuration = StampedeConfiguration {
            users: Some(8),
            iterations: Some(0),
            run_time: "30s".to_string(),
            startup_time: "4".to_string(),
            ..Default::default()
        };
        let changed = configuration.apply(definition());
        assert_eq!(changed.concurrency, 8);
        assert_eq!(changed.iterations, 0);
        assert_eq!(changed.duration, Some("30s".to_string()));
        assert_eq!(changed.ramp_up, Some("4".to_string()));
        assert_eq!(changed.actions.len(), 1);
    }

    #[test]
    fn invalid_options() {
        let configuration = StampedeConfiguration {
            run_time: "forever".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            configuration.validate(),
            Err(StampedeError::InvalidOption { option, .. }) if option == "--run-time"
        ));

        let configuration = StampedeConfiguration {
            outcome_format: Some(LogFormat::Json),
            ..Default::default()
        };
        assert!(configuration.validate().is_err());
    }

    #[test]
    fn timeouts() {
        assert_eq!(StampedeConfiguration::default().request_timeout().unwrap(), None);
        let configuration = StampedeConfiguration {
            timeout: "1m".to_string(),
            ..Default::default()
        };
        assert_eq!(
            configuration.request_timeout().unwrap(),
            Some(time::Duration::from_secs(60))
        );
    }
}
