//! Workload definitions and their validated runtime form.
//!
//! A load test is described by a [`WorkloadDefinition`]: a loosely typed value,
//! typically deserialized from JSON by a scripting or configuration front-end.
//! Before anything runs it is validated into an immutable [`Workload`], which is
//! then shared read-only by every virtual user.
//!
//! ## Defining a workload
//!
//! ```rust
//! use stampede::prelude::*;
//!
//! let definition = WorkloadDefinition::new(10, 100)
//!     .register_action(
//!         ActionDefinition::get("http://localhost:8080/")
//!             .register_check(CheckDefinition::status("success login", 200)),
//!     );
//! let workload = Workload::try_from(definition).unwrap();
//! assert_eq!(workload.concurrency(), 10);
//! assert_eq!(workload.iterations(), 100);
//! ```
//!
//! The same workload as JSON:
//!
//! ```rust
//! use stampede::prelude::*;
//!
//! let definition: WorkloadDefinition = serde_json::from_str(r#"{
//!     "concurrency": 10,
//!     "iterations": 100,
//!     "actions": [{
//!         "method": "GET",
//!         "url": "http://localhost:8080/",
//!         "checks": [{ "kind": "status", "name": "success login", "equals": 200 }]
//!     }]
//! }"#).unwrap();
//! assert!(Workload::try_from(definition).is_ok());
//! ```

use http::StatusCode;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::{fmt, time};
use url::Url;

use crate::transport::Response;
use crate::util;
use crate::StampedeError;

/// Supported HTTP methods.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Delete,
    Get,
    Head,
    Patch,
    Post,
    Put,
}
impl FromStr for Method {
    type Err = StampedeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DELETE" => Ok(Method::Delete),
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "PATCH" => Ok(Method::Patch),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            _ => Err(StampedeError::InvalidOption {
                option: "action.method".to_string(),
                value: s.to_string(),
                detail: "Invalid method, expected: DELETE, GET, HEAD, PATCH, POST, or PUT"
                    .to_string(),
            }),
        }
    }
}
impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let method = match self {
            Method::Delete => "DELETE",
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Patch => "PATCH",
            Method::Post => "POST",
            Method::Put => "PUT",
        };
        write!(f, "{}", method)
    }
}
impl From<Method> for http::Method {
    fn from(method: Method) -> http::Method {
        match method {
            Method::Delete => http::Method::DELETE,
            Method::Get => http::Method::GET,
            Method::Head => http::Method::HEAD,
            Method::Patch => http::Method::PATCH,
            Method::Post => http::Method::POST,
            Method::Put => http::Method::PUT,
        }
    }
}

/// How the scheduler grows the number of active virtual users toward the
/// configured concurrency.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RampPolicy {
    /// Launch every virtual user at once.
    #[default]
    Instant,
    /// Spread launches evenly over the given warm-up window.
    Linear(time::Duration),
}

/// The loosely typed description of a check, as supplied by a front-end.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckDefinition {
    /// The response status equals `equals`.
    Status { name: String, equals: i64 },
    /// The response status is 2xx.
    Success { name: String },
    /// The response body contains `text`.
    BodyContains { name: String, text: String },
    /// The response body matches the regular expression `pattern`.
    BodyMatches { name: String, pattern: String },
    /// The request completed in under `millis` milliseconds.
    LatencyBelow { name: String, millis: u64 },
}
impl CheckDefinition {
    pub fn status(name: &str, equals: i64) -> Self {
        CheckDefinition::Status {
            name: name.to_string(),
            equals,
        }
    }

    pub fn success(name: &str) -> Self {
        CheckDefinition::Success {
            name: name.to_string(),
        }
    }

    pub fn body_contains(name: &str, text: &str) -> Self {
        CheckDefinition::BodyContains {
            name: name.to_string(),
            text: text.to_string(),
        }
    }

    pub fn body_matches(name: &str, pattern: &str) -> Self {
        CheckDefinition::BodyMatches {
            name: name.to_string(),
            pattern: pattern.to_string(),
        }
    }

    pub fn latency_below(name: &str, millis: u64) -> Self {
        CheckDefinition::LatencyBelow {
            name: name.to_string(),
            millis,
        }
    }

    fn name(&self) -> &str {
        match self {
            CheckDefinition::Status { name, .. }
            | CheckDefinition::Success { name }
            | CheckDefinition::BodyContains { name, .. }
            | CheckDefinition::BodyMatches { name, .. }
            | CheckDefinition::LatencyBelow { name, .. } => name,
        }
    }
}

/// The loosely typed description of one action.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionDefinition {
    /// Optional name used in metrics, defaults to `"METHOD /path"`.
    pub name: Option<String>,
    /// HTTP method, case-insensitive.
    pub method: String,
    /// Absolute URL to request.
    pub url: String,
    /// Checks evaluated against every response.
    pub checks: Vec<CheckDefinition>,
}
impl ActionDefinition {
    pub fn new(method: &str, url: &str) -> Self {
        ActionDefinition {
            name: None,
            method: method.to_string(),
            url: url.to_string(),
            checks: Vec::new(),
        }
    }

    pub fn get(url: &str) -> Self {
        ActionDefinition::new("GET", url)
    }

    pub fn post(url: &str) -> Self {
        ActionDefinition::new("POST", url)
    }

    pub fn set_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn register_check(mut self, check: CheckDefinition) -> Self {
        self.checks.push(check);
        self
    }
}

/// The loosely typed description of a load test.
///
/// Integers are signed and time spans are strings so that whatever a front-end
/// hands over can be represented, and rejected with a useful error by
/// [`Workload::try_from`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadDefinition {
    /// How many virtual users run concurrently.
    pub concurrency: i64,
    /// Total iterations shared by all virtual users, 0 for no limit.
    pub iterations: i64,
    /// Optional bound on how long the load test runs, ie "30s" or "1m30s".
    pub duration: Option<String>,
    /// Optional warm-up window over which virtual users are launched.
    pub ramp_up: Option<String>,
    /// Optional minimum and maximum pause between iterations.
    pub think_time: Option<(String, String)>,
    /// Actions performed, in order, by every iteration.
    pub actions: Vec<ActionDefinition>,
}
impl WorkloadDefinition {
    pub fn new(concurrency: i64, iterations: i64) -> Self {
        WorkloadDefinition {
            concurrency,
            iterations,
            ..Default::default()
        }
    }

    pub fn set_duration(mut self, duration: &str) -> Self {
        self.duration = Some(duration.to_string());
        self
    }

    pub fn set_ramp_up(mut self, ramp_up: &str) -> Self {
        self.ramp_up = Some(ramp_up.to_string());
        self
    }

    pub fn set_think_time(mut self, min: &str, max: &str) -> Self {
        self.think_time = Some((min.to_string(), max.to_string()));
        self
    }

    pub fn register_action(mut self, action: ActionDefinition) -> Self {
        self.actions.push(action);
        self
    }
}

/// The closed set of predicates a [`Check`] can evaluate.
#[derive(Clone, Debug)]
pub enum CheckKind {
    StatusEquals(u16),
    StatusSuccess,
    BodyContains(String),
    BodyMatches(Regex),
    LatencyBelow(time::Duration),
}

/// A named predicate evaluated against every response to an [`Action`].
#[derive(Clone, Debug)]
pub struct Check {
    pub name: String,
    pub kind: CheckKind,
}
impl Check {
    /// Returns `true` if the response satisfies this check.
    pub fn evaluate(&self, response: &Response) -> bool {
        match &self.kind {
            CheckKind::StatusEquals(status) => response.status == *status,
            CheckKind::StatusSuccess => StatusCode::from_u16(response.status)
                .map(|status| status.is_success())
                .unwrap_or(false),
            CheckKind::BodyContains(text) => response.body.contains(text.as_str()),
            CheckKind::BodyMatches(re) => re.is_match(&response.body),
            CheckKind::LatencyBelow(limit) => response.latency < *limit,
        }
    }
}
impl TryFrom<CheckDefinition> for Check {
    type Error = StampedeError;

    fn try_from(definition: CheckDefinition) -> Result<Self, Self::Error> {
        if definition.name().trim().is_empty() {
            return Err(StampedeError::InvalidCheck {
                name: definition.name().to_string(),
                detail: "Checks must be named.".to_string(),
            });
        }
        let kind = match &definition {
            CheckDefinition::Status { name, equals } => {
                if !(100..=999).contains(equals) {
                    return Err(StampedeError::InvalidCheck {
                        name: name.to_string(),
                        detail: format!("{} is not a valid status code.", equals),
                    });
                }
                CheckKind::StatusEquals(*equals as u16)
            }
            CheckDefinition::Success { .. } => CheckKind::StatusSuccess,
            CheckDefinition::BodyContains { text, .. } => CheckKind::BodyContains(text.clone()),
            CheckDefinition::BodyMatches { name, pattern } => match Regex::new(pattern) {
                Ok(re) => CheckKind::BodyMatches(re),
                Err(e) => {
                    return Err(StampedeError::InvalidCheck {
                        name: name.to_string(),
                        detail: format!("Invalid pattern: {}", e),
                    })
                }
            },
            CheckDefinition::LatencyBelow { millis, .. } => {
                CheckKind::LatencyBelow(time::Duration::from_millis(*millis))
            }
        };
        Ok(Check {
            name: definition.name().to_string(),
            kind,
        })
    }
}

/// One validated step of an iteration.
#[derive(Clone, Debug)]
pub struct Action {
    pub name: String,
    pub method: Method,
    pub url: Url,
    pub checks: Vec<Check>,
}
impl TryFrom<ActionDefinition> for Action {
    type Error = StampedeError;

    fn try_from(definition: ActionDefinition) -> Result<Self, Self::Error> {
        let method = Method::from_str(&definition.method)?;
        let url = Url::parse(&definition.url).map_err(|parse_error| StampedeError::InvalidUrl {
            url: definition.url.clone(),
            detail: "Actions require an absolute URL.".to_string(),
            parse_error,
        })?;
        let name = match definition.name {
            Some(name) if !name.is_empty() => name,
            _ => format!("{} {}", method, url.path()),
        };
        let checks = definition
            .checks
            .into_iter()
            .map(Check::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Action {
            name,
            method,
            url,
            checks,
        })
    }
}

/// A validated, immutable load test description.
#[derive(Clone, Debug)]
pub struct Workload {
    concurrency: usize,
    iterations: usize,
    duration: Option<time::Duration>,
    ramp: RampPolicy,
    think_time: Option<(time::Duration, time::Duration)>,
    actions: Vec<Action>,
}
impl Workload {
    /// Target number of concurrent virtual users.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Total iteration budget, 0 when unbounded.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Optional bound on how long the load test runs.
    pub fn duration(&self) -> Option<time::Duration> {
        self.duration
    }

    pub fn ramp(&self) -> &RampPolicy {
        &self.ramp
    }

    pub fn think_time(&self) -> Option<(time::Duration, time::Duration)> {
        self.think_time
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Returns `true` if nothing but external cancellation can end this workload.
    pub fn is_unbounded(&self) -> bool {
        self.concurrency > 0 && self.iterations == 0 && self.duration.is_none()
    }
}

// Parse an optional time span, treating zero as "not set".
fn optional_timespan(
    option: &str,
    value: &Option<String>,
) -> Result<Option<time::Duration>, StampedeError> {
    match value {
        None => Ok(None),
        Some(value) => match util::parse_duration(value) {
            Some(duration) if duration.as_secs() == 0 => Ok(None),
            Some(duration) => Ok(Some(duration)),
            None => Err(StampedeError::InvalidOption {
                option: option.to_string(),
                value: value.to_string(),
                detail: "Expected a time span such as 30, 30s, 20m, 3h or 1h30m.".to_string(),
            }),
        },
    }
}

fn non_negative(option: &str, value: i64) -> Result<usize, StampedeError> {
    if value < 0 {
        Err(StampedeError::InvalidOption {
            option: option.to_string(),
            value: value.to_string(),
            detail: format!("{} must not be negative.", option),
        })
    } else {
        Ok(value as usize)
    }
}

impl TryFrom<WorkloadDefinition> for Workload {
    type Error = StampedeError;

    fn try_from(definition: WorkloadDefinition) -> Result<Self, Self::Error> {
        let concurrency = non_negative("concurrency", definition.concurrency)?;
        let iterations = non_negative("iterations", definition.iterations)?;
        let duration = optional_timespan("duration", &definition.duration)?;
        let ramp = match optional_timespan("ramp_up", &definition.ramp_up)? {
            Some(window) => RampPolicy::Linear(window),
            None => RampPolicy::Instant,
        };
        let think_time = match &definition.think_time {
            None => None,
            Some((min, max)) => {
                let parse = |value: &String| {
                    util::parse_duration(value).ok_or_else(|| StampedeError::InvalidOption {
                        option: "think_time".to_string(),
                        value: value.to_string(),
                        detail: "Expected a time span such as 1 or 2s.".to_string(),
                    })
                };
                let (min, max) = (parse(min)?, parse(max)?);
                if min > max {
                    return Err(StampedeError::InvalidOption {
                        option: "think_time".to_string(),
                        value: format!("{:?}..{:?}", min, max),
                        detail: "Minimum think time must not exceed the maximum.".to_string(),
                    });
                }
                if max.as_nanos() == 0 {
                    None
                } else {
                    Some((min, max))
                }
            }
        };
        if definition.actions.is_empty() {
            return Err(StampedeError::InvalidOption {
                option: "actions".to_string(),
                value: "[]".to_string(),
                detail: "A workload requires at least one action.".to_string(),
            });
        }
        let actions = definition
            .actions
            .into_iter()
            .map(Action::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Workload {
            concurrency,
            iterations,
            duration,
            ramp,
            think_time,
            actions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> ActionDefinition {
        ActionDefinition::get("http://localhost:8080/")
    }

    #[test]
    fn valid_workload() {
        let workload = Workload::try_from(
            WorkloadDefinition::new(10_000, 100_000)
                .set_duration("1m30s")
                .set_ramp_up("10s")
                .set_think_time("0", "2")
                .register_action(index().register_check(CheckDefinition::status("ok", 200))),
        )
        .unwrap();
        assert_eq!(workload.concurrency(), 10_000);
        assert_eq!(workload.iterations(), 100_000);
        assert_eq!(workload.duration(), Some(time::Duration::from_secs(90)));
        assert_eq!(
            workload.ramp(),
            &RampPolicy::Linear(time::Duration::from_secs(10))
        );
        assert_eq!(
            workload.think_time(),
            Some((time::Duration::from_secs(0), time::Duration::from_secs(2)))
        );
        assert_eq!(workload.actions().len(), 1);
        assert_eq!(workload.actions()[0].name, "GET /");
        assert_eq!(workload.actions()[0].checks[0].name, "ok");
        assert!(!workload.is_unbounded());
    }

    #[test]
    fn zero_spans_are_unset() {
        let workload = Workload::try_from(
            WorkloadDefinition::new(1, 0)
                .set_duration("0")
                .set_ramp_up("0s")
                .register_action(index()),
        )
        .unwrap();
        assert_eq!(workload.duration(), None);
        assert_eq!(workload.ramp(), &RampPolicy::Instant);
        assert!(workload.is_unbounded());
    }

    #[test]
    fn negative_values_are_rejected() {
        let error = Workload::try_from(WorkloadDefinition::new(-1, 5).register_action(index()))
            .unwrap_err();
        assert!(error.is_configuration());
        match error {
            StampedeError::InvalidOption { option, value, .. } => {
                assert_eq!(option, "concurrency");
                assert_eq!(value, "-1");
            }
            _ => panic!("unexpected error: {:?}", error),
        }

        let error = Workload::try_from(WorkloadDefinition::new(1, -5).register_action(index()))
            .unwrap_err();
        assert!(error.is_configuration());
    }

    #[test]
    fn empty_actions_are_rejected() {
        let error = Workload::try_from(WorkloadDefinition::new(1, 1)).unwrap_err();
        assert!(error.is_configuration());
    }

    #[test]
    fn invalid_actions_are_rejected() {
        let invalid = vec![
            ActionDefinition::new("FETCH", "http://localhost/"),
            ActionDefinition::get("/relative/path"),
            index().register_check(CheckDefinition::status("ok", 42)),
            index().register_check(CheckDefinition::body_matches("bad", "(unclosed")),
            index().register_check(CheckDefinition::success(" ")),
        ];
        for action in invalid {
            let result = Workload::try_from(WorkloadDefinition::new(1, 1).register_action(action));
            assert!(result.unwrap_err().is_configuration());
        }
    }

    #[test]
    fn invalid_timespans_are_rejected() {
        let definition = WorkloadDefinition::new(1, 1).register_action(index());
        assert!(Workload::try_from(definition.clone().set_duration("soon")).is_err());
        assert!(Workload::try_from(definition.clone().set_ramp_up("-5")).is_err());
        assert!(matches!(
            Workload::try_from(definition.clone().set_duration("9999999999999999h")),
            Err(StampedeError::InvalidOption { .. })
        ));
        assert!(Workload::try_from(definition.set_think_time("5", "1")).is_err());
    }

    #[test]
    fn methods() {
        assert_eq!(Method::from_str("get").unwrap(), Method::Get);
        assert_eq!(Method::from_str("Post").unwrap(), Method::Post);
        assert!(Method::from_str("TRACE").is_err());
        assert_eq!(Method::Patch.to_string(), "PATCH");
        assert_eq!(http::Method::from(Method::Delete), http::Method::DELETE);
    }

    #[test]
    fn checks() {
        let response = Response::new(200, time::Duration::from_millis(20)).set_body("Hello world");
        let evaluate = |definition: CheckDefinition| {
            Check::try_from(definition).unwrap().evaluate(&response)
        };
        assert!(evaluate(CheckDefinition::status("200", 200)));
        assert!(!evaluate(CheckDefinition::status("404", 404)));
        assert!(evaluate(CheckDefinition::success("2xx")));
        assert!(evaluate(CheckDefinition::body_contains("hello", "Hello")));
        assert!(!evaluate(CheckDefinition::body_contains("bye", "Goodbye")));
        assert!(evaluate(CheckDefinition::body_matches("world", r"w.rld$")));
        assert!(evaluate(CheckDefinition::latency_below("fast", 50)));
        assert!(!evaluate(CheckDefinition::latency_below("faster", 10)));

        let redirect = Response::new(302, time::Duration::from_millis(1));
        let success = Check::try_from(CheckDefinition::success("2xx")).unwrap();
        assert!(!success.evaluate(&redirect));
    }

    #[test]
    fn deserialize_definition() {
        let definition: WorkloadDefinition = serde_json::from_str(
            r#"{
                "concurrency": 2,
                "iterations": 4,
                "duration": "10s",
                "actions": [
                    {
                        "name": "front page",
                        "method": "get",
                        "url": "http://localhost:8080/",
                        "checks": [
                            { "kind": "status", "name": "success login", "equals": 200 },
                            { "kind": "latency_below", "name": "fast", "millis": 500 }
                        ]
                    }
                ]
            }"#,
        )
        .unwrap();
        let workload = Workload::try_from(definition).unwrap();
        assert_eq!(workload.actions()[0].name, "front page");
        assert_eq!(workload.actions()[0].checks.len(), 2);
        assert_eq!(workload.duration(), Some(time::Duration::from_secs(10)));
    }
}
