//! Utility functions used by Stampede, and available when building workloads.

use lazy_static::lazy_static;
use num_format::{Locale, ToFormattedString};
use regex::Regex;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;
use std::time;

use crate::shutdown::StopSignal;

lazy_static! {
    /// Process-wide stop signal raised by the ctrl-c handler.
    pub(crate) static ref CTRLC: StopSignal = StopSignal::new();
}

static CTRLC_HANDLER: Once = Once::new();

// Number of running load tests watching for ctrl-c.
static CTRLC_WATCHERS: AtomicUsize = AtomicUsize::new(0);

/// Parse a string representing a time span and return the number of seconds.
///
/// Can be specified as an integer, indicating seconds. Or can use integers
/// together with one or more of "h", "m", and "s", in that order, indicating
/// "hours", "minutes", and "seconds".
///
/// Valid formats include: 20, 20s, 3m, 2h, 1h20m, 3h30m10s, etc.
///
/// # Example
/// ```rust
/// use stampede::util;
///
/// // 1 hour 2 minutes and 3 seconds is 3,723 seconds.
/// assert_eq!(util::parse_timespan("1h2m3s"), 3_723);
///
/// // 45 seconds is 45 seconds.
/// assert_eq!(util::parse_timespan("45"), 45);
///
/// // Invalid value is 0 seconds.
/// assert_eq!(util::parse_timespan("foo"), 0);
/// ```
pub fn parse_timespan(time_str: &str) -> usize {
    checked_timespan(time_str).unwrap_or_else(|| {
        warn!("time span {} is too large, using 0", time_str);
        0
    })
}

// Count the seconds in a time span, returning `None` if the total doesn't fit.
fn checked_timespan(time_str: &str) -> Option<usize> {
    match usize::from_str(time_str) {
        // An integer is a number of seconds.
        Ok(t) => {
            trace!("{} is integer: {} seconds", time_str, t);
            Some(t)
        }
        // Digits alone that don't parse are too large.
        Err(_) if !time_str.is_empty() && time_str.bytes().all(|b| b.is_ascii_digit()) => None,
        Err(_) => {
            let re = match Regex::new(
                r"((?P<hours>\d+?)h)?((?P<minutes>\d+?)m)?((?P<seconds>\d+?)s)?",
            ) {
                Ok(re) => re,
                Err(_) => return Some(0),
            };
            let time_matches = match re.captures(time_str) {
                Some(captures) => captures,
                None => return Some(0),
            };
            let capture = |name: &str| -> Option<usize> {
                match time_matches.name(name) {
                    Some(m) => usize::from_str(m.as_str()).ok(),
                    None => Some(0),
                }
            };
            let hours = capture("hours")?;
            let minutes = capture("minutes")?;
            let seconds = capture("seconds")?;
            let total = hours
                .checked_mul(60 * 60)?
                .checked_add(minutes.checked_mul(60)?)?
                .checked_add(seconds)?;
            trace!(
                "{} hours {} minutes {} seconds: {} seconds",
                hours,
                minutes,
                seconds,
                total
            );
            Some(total)
        }
    }
}

/// Parse a time span into a [`Duration`](std::time::Duration), rejecting spans
/// that are neither a plain integer nor a valid `h`/`m`/`s` combination, or
/// that are too large to count in seconds.
///
/// # Example
/// ```rust
/// use stampede::util;
/// use std::time::Duration;
///
/// assert_eq!(util::parse_duration("1m30s"), Some(Duration::from_secs(90)));
/// assert_eq!(util::parse_duration("0"), Some(Duration::from_secs(0)));
/// assert_eq!(util::parse_duration("soon"), None);
/// ```
pub fn parse_duration(time_str: &str) -> Option<time::Duration> {
    let trimmed = time_str.trim();
    let valid = Regex::new(r"^(\d+|(\d+h)?(\d+m)?(\d+s)?)$")
        .map(|re| !trimmed.is_empty() && re.is_match(trimmed))
        .unwrap_or(false);
    if valid {
        checked_timespan(trimmed).map(|seconds| time::Duration::from_secs(seconds as u64))
    } else {
        None
    }
}

/// Sleep for a specified duration, minus the time spent doing other things.
///
/// Returns a fresh drift timer to use for the next loop.
pub async fn sleep_minus_drift(
    duration: time::Duration,
    drift: tokio::time::Instant,
) -> tokio::time::Instant {
    match duration.checked_sub(drift.elapsed()) {
        Some(delay) if delay.as_nanos() > 0 => tokio::time::sleep(delay).await,
        _ => debug!("sleep_minus_drift: drift was greater than or equal to duration, not sleeping"),
    };
    tokio::time::Instant::now()
}

/// Determine if a timer expired, with millisecond granularity.
///
/// A timer of 0 milliseconds never expires.
///
/// # Example
/// ```rust
/// use stampede::util;
///
/// let started = std::time::Instant::now();
/// assert!(!util::ms_timer_expired(started, 0));
/// assert!(!util::ms_timer_expired(started, 60_000));
/// ```
pub fn ms_timer_expired(started: time::Instant, elapsed: usize) -> bool {
    elapsed > 0 && started.elapsed().as_millis() >= elapsed as u128
}

/// Truncate strings when they're too long to display.
///
/// # Example
/// ```rust
/// use stampede::util;
///
/// assert_eq!(util::truncate_string("this is a long string", 9), "this is..");
/// assert_eq!(util::truncate_string("shorter string", 15), "shorter string");
/// ```
pub fn truncate_string(str_to_truncate: &str, max_length: usize) -> String {
    if str_to_truncate.char_indices().count() > max_length {
        match str_to_truncate.char_indices().nth(max_length.saturating_sub(2)) {
            None => str_to_truncate.to_string(),
            Some((idx, _)) => format!("{}..", &str_to_truncate[..idx]),
        }
    } else {
        str_to_truncate.to_string()
    }
}

/// Format large number in locale appropriate style.
///
/// # Example
/// ```rust
/// use stampede::util;
///
/// assert_eq!(util::format_number(100_000), "100,000");
/// ```
pub fn format_number(number: usize) -> String {
    number.to_formatted_string(&Locale::en)
}

// Install the ctrl-c handler once per process. The first ctrl-c raises CTRLC so
// running load tests stop cleanly, a second one exits immediately.
pub(crate) fn setup_ctrlc_handler() {
    CTRLC_HANDLER.call_once(|| {
        if let Err(e) = ctrlc::set_handler(move || {
            if CTRLC.is_stopped() {
                warn!("caught another ctrl-c, exiting immediately...");
                std::process::exit(1);
            } else {
                warn!("caught ctrl-c, stopping...");
                CTRLC.stop();
            }
        }) {
            info!("failed to set ctrl-c handler: {}", e);
        }
    });
}

/// Registers a running load test with a process-wide stop signal.
///
/// The signal is cleared only when the first watcher registers, so a load test
/// starting while another is running can't swallow a ctrl-c meant for it.
pub(crate) struct SignalWatch {
    watchers: &'static AtomicUsize,
    signal: &'static StopSignal,
}
impl SignalWatch {
    pub(crate) fn new(watchers: &'static AtomicUsize, signal: &'static StopSignal) -> Self {
        if watchers.fetch_add(1, Ordering::SeqCst) == 0 {
            signal.reset();
        }
        SignalWatch { watchers, signal }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.signal.is_stopped()
    }
}
impl Drop for SignalWatch {
    fn drop(&mut self) {
        self.watchers.fetch_sub(1, Ordering::SeqCst);
    }
}

// Start watching for ctrl-c, installing the handler if needed.
pub(crate) fn watch_ctrlc() -> SignalWatch {
    let watch = SignalWatch::new(&CTRLC_WATCHERS, &CTRLC);
    setup_ctrlc_handler();
    watch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespan() {
        assert_eq!(parse_timespan("0"), 0);
        assert_eq!(parse_timespan("foo"), 0);
        assert_eq!(parse_timespan("1"), 1);
        assert_eq!(parse_timespan("1s"), 1);
        assert_eq!(parse_timespan("1m"), 60);
        assert_eq!(parse_timespan("1m1s"), 61);
        assert_eq!(parse_timespan("10m5s"), 605);
        assert_eq!(parse_timespan("1h"), 3600);
        assert_eq!(parse_timespan("1h5m13s"), 3913);
        assert_eq!(parse_timespan("24h"), 86400);
        assert_eq!(parse_timespan("9999999999999999h"), 0);
    }

    #[test]
    fn duration() {
        assert_eq!(parse_duration("1"), Some(time::Duration::from_secs(1)));
        assert_eq!(parse_duration(" 2m "), Some(time::Duration::from_secs(120)));
        assert_eq!(
            parse_duration("1h1m1s"),
            Some(time::Duration::from_secs(3661))
        );
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("15mins"), None);
        assert_eq!(parse_duration("-1"), None);
        assert_eq!(parse_duration("9999999999999999h"), None);
        assert_eq!(parse_duration("99999999999999999999"), None);
        assert_eq!(parse_duration("1h18446744073709551615s"), None);
    }

    #[test]
    fn truncate() {
        assert_eq!(
            truncate_string("the quick brown fox", 25),
            "the quick brown fox"
        );
        assert_eq!(truncate_string("the quick brown fox", 10), "the quic..");
        assert_eq!(truncate_string("abcde", 5), "abcde");
        assert_eq!(truncate_string("abcde", 4), "ab..");
        assert_eq!(truncate_string("これはテストだ", 3), "こ..");
    }

    #[test]
    fn numbers() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[tokio::test]
    async fn ms_timer() {
        let started = time::Instant::now();
        assert!(!ms_timer_expired(started, 0));
        assert!(!ms_timer_expired(started, 60_000));
        tokio::time::sleep(time::Duration::from_millis(60)).await;
        assert!(ms_timer_expired(started, 50));
    }

    #[tokio::test]
    async fn drift() {
        let drift = tokio::time::Instant::now();
        tokio::time::sleep(time::Duration::from_millis(30)).await;
        let started = time::Instant::now();
        // 30 of the 100 milliseconds were already spent.
        sleep_minus_drift(time::Duration::from_millis(100), drift).await;
        assert!(started.elapsed() < time::Duration::from_millis(100));
    }

    #[test]
    fn signal_watch_resets_only_when_idle() {
        static WATCHERS: AtomicUsize = AtomicUsize::new(0);
        lazy_static! {
            static ref SIGNAL: StopSignal = StopSignal::new();
        }

        // A stale signal from an earlier run is cleared.
        SIGNAL.stop();
        let first = SignalWatch::new(&WATCHERS, &SIGNAL);
        assert!(!first.is_stopped());

        // A second run starting doesn't clear a stop meant for the first.
        SIGNAL.stop();
        let second = SignalWatch::new(&WATCHERS, &SIGNAL);
        assert!(first.is_stopped());
        assert!(second.is_stopped());
        assert_eq!(WATCHERS.load(Ordering::SeqCst), 2);

        drop(first);
        drop(second);
        assert_eq!(WATCHERS.load(Ordering::SeqCst), 0);
        let third = SignalWatch::new(&WATCHERS, &SIGNAL);
        assert!(!third.is_stopped());
    }
}
