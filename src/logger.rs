//! Optional outcome log.
//!
//! The outcome log is enabled with the `--outcome-log` run-time option. When enabled,
//! a logger task is launched and a channel is provided to every virtual user, which
//! sends each [`Outcome`] for efficient logging to file. The logger task uses
//! Tokio's asynchronous [`BufWriter`](https://docs.rs/tokio/*/tokio/io/struct.BufWriter.html).
//!
//! The format of the log is configured with `--outcome-format`:
//!  - `json` (default): one JSON object per line
//!  - `csv`: a header row followed by one row per outcome
//!  - `raw`: the `Debug` representation of each outcome
//!  - `pretty`: the pretty-printed `Debug` representation of each outcome
//!
//! A JSON formatted outcome looks like:
//! ```json
//! {"elapsed":13,"user":1,"iteration":1,"action_index":0,"name":"GET /","method":"GET","response_time":2,"status":200,"success":true,"failure":null,"checks":[{"name":"status is 200","passed":true}]}
//! ```

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::config::StampedeConfiguration;
use crate::metrics::Outcome;
use crate::StampedeError;

/// Channel used by virtual users to send outcomes to the logger task. `None` tells
/// the logger task to flush and exit.
pub type OutcomeLogTx = Option<flume::Sender<Option<Outcome>>>;

/// Handle of the logger task, if the outcome log is enabled.
pub type OutcomeLogJoinHandle =
    Option<tokio::task::JoinHandle<Result<(), StampedeError>>>;

/// Supported outcome log formats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    Csv,
    #[default]
    Json,
    Raw,
    Pretty,
}
impl FromStr for LogFormat {
    type Err = StampedeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let log_format = RegexSet::new([
            r"(?i)^csv$",
            r"(?i)^(json|jsn)$",
            r"(?i)^raw$",
            r"(?i)^pretty$",
        ])
        .map_err(|e| StampedeError::InvalidOption {
            option: "--outcome-format".to_string(),
            value: s.to_string(),
            detail: e.to_string(),
        })?;
        let matches = log_format.matches(s);
        if matches.matched(0) {
            Ok(LogFormat::Csv)
        } else if matches.matched(1) {
            Ok(LogFormat::Json)
        } else if matches.matched(2) {
            Ok(LogFormat::Raw)
        } else if matches.matched(3) {
            Ok(LogFormat::Pretty)
        } else {
            Err(StampedeError::InvalidOption {
                option: "--outcome-format".to_string(),
                value: s.to_string(),
                detail: "Supported formats are: csv, json, raw, pretty.".to_string(),
            })
        }
    }
}

// Quote a CSV field if it contains a delimiter, quote or newline.
fn csv_field(field: &str) -> String {
    if field.contains(|c: char| c == ',' || c == '"' || c == '\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

impl Outcome {
    /// Header row for outcome logs in the `csv` format.
    pub fn csv_header() -> &'static str {
        "elapsed,user,iteration,action_index,name,method,response_time,status,success,failure,checks_failed"
    }

    fn to_csv(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{}",
            self.elapsed,
            self.user,
            self.iteration,
            self.action_index,
            csv_field(&self.name),
            self.method,
            self.response_time,
            self.status.map(|status| status.to_string()).unwrap_or_default(),
            self.success,
            csv_field(
                &self
                    .failure
                    .as_ref()
                    .map(|failure| failure.to_string())
                    .unwrap_or_default()
            ),
            self.checks.iter().filter(|check| !check.passed).count(),
        )
    }

    /// Render the outcome as one entry of an outcome log.
    pub fn format(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Csv => self.to_csv(),
            LogFormat::Json => serde_json::to_string(self).unwrap_or_default(),
            LogFormat::Raw => format!("{:?}", self),
            LogFormat::Pretty => format!("{:#?}", self),
        }
    }
}

impl StampedeConfiguration {
    /// Create the outcome log file and launch the logger task, if enabled.
    ///
    /// The file is created before any virtual user launches, so an unwritable path
    /// fails the load test up front.
    pub(crate) async fn setup_outcome_log(
        &self,
    ) -> Result<(OutcomeLogJoinHandle, OutcomeLogTx), StampedeError> {
        if self.outcome_log.is_empty() {
            return Ok((None, None));
        }
        let file = File::create(&self.outcome_log).await?;
        info!("writing outcomes to {}", &self.outcome_log);
        let (sender, receiver) = flume::unbounded();
        let handle = tokio::spawn(logger_main(
            self.outcome_log.clone(),
            self.outcome_format.unwrap_or_default(),
            file,
            receiver,
        ));
        Ok((Some(handle), Some(sender)))
    }
}

// Write outcomes until told to exit, then flush to disk.
async fn logger_main(
    path: String,
    format: LogFormat,
    file: File,
    receiver: flume::Receiver<Option<Outcome>>,
) -> Result<(), StampedeError> {
    let mut file = BufWriter::with_capacity(64 * 1024, file);
    if format == LogFormat::Csv {
        file.write_all(format!("{}\n", Outcome::csv_header()).as_bytes())
            .await?;
    }

    while let Ok(message) = receiver.recv_async().await {
        match message {
            Some(outcome) => {
                if let Err(e) = file
                    .write_all(format!("{}\n", outcome.format(format)).as_bytes())
                    .await
                {
                    warn!("failed to write to {}: {}", &path, e);
                }
            }
            // Empty message means it's time to exit.
            None => break,
        }
    }

    info!("flushing outcome log: {}", &path);
    file.flush().await?;
    Ok(())
}
