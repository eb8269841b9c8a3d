/// Validate that the outcome log records every action in the configured format.
use httpmock::{Method::GET, Mock, MockServer};
use serial_test::serial;

mod common;

use stampede::metrics::Outcome;

// Paths used in load tests performed during these tests.
const INDEX_PATH: &str = "/";
const ERROR_PATH: &str = "/error";

// Indexes to the above paths.
const INDEX_KEY: usize = 0;
const ERROR_KEY: usize = 1;

fn setup_mock_server_endpoints(server: &MockServer) -> Vec<Mock> {
    vec![
        server.mock(|when, then| {
            when.method(GET).path(INDEX_PATH);
            then.status(200);
        }),
        server.mock(|when, then| {
            when.method(GET).path(ERROR_PATH);
            then.status(503);
        }),
    ]
}

// Run a load test with two actions and three iterations, writing the outcome log.
async fn run_logged_load_test(outcome_log: &str, format: &str) -> stampede::metrics::RunSummary {
    let server = MockServer::start();
    let mock_endpoints = setup_mock_server_endpoints(&server);

    let configuration = common::build_configuration(vec![
        "--users",
        "2",
        "--iterations",
        "3",
        "--outcome-log",
        outcome_log,
        "--outcome-format",
        format,
    ]);
    let summary = common::run_load_test(common::build_load_test(
        common::build_definition(&server, &[INDEX_PATH, ERROR_PATH]),
        configuration,
    ))
    .await;

    assert_eq!(mock_endpoints[INDEX_KEY].hits(), 3);
    assert_eq!(mock_endpoints[ERROR_KEY].hits(), 3);
    summary
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn json_outcome_log() {
    let outcome_log = "outcomes-json-test.log";
    common::cleanup_files(vec![outcome_log]);

    let summary = run_logged_load_test(outcome_log, "json").await;
    assert_eq!(common::file_length(outcome_log), summary.attempted);

    let contents = std::fs::read_to_string(outcome_log).unwrap();
    let outcomes: Vec<Outcome> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(outcomes.len(), 6);
    assert_eq!(outcomes.iter().filter(|outcome| outcome.success).count(), 3);
    assert!(outcomes
        .iter()
        .filter(|outcome| !outcome.success)
        .all(|outcome| outcome.status == Some(503) && outcome.action_index == 1));

    // Within a user, outcomes are ordered by iteration and then action.
    for user in 1..=2 {
        let positions: Vec<(usize, usize)> = outcomes
            .iter()
            .filter(|outcome| outcome.user == user)
            .map(|outcome| (outcome.iteration, outcome.action_index))
            .collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);
    }

    common::cleanup_files(vec![outcome_log]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn csv_outcome_log() {
    let outcome_log = "outcomes-csv-test.log";
    common::cleanup_files(vec![outcome_log]);

    let summary = run_logged_load_test(outcome_log, "csv").await;
    // One header row plus one row per outcome.
    assert_eq!(common::file_length(outcome_log), summary.attempted + 1);

    let contents = std::fs::read_to_string(outcome_log).unwrap();
    assert_eq!(contents.lines().next(), Some(Outcome::csv_header()));
    assert_eq!(contents.matches(",503,false,").count(), 3);

    common::cleanup_files(vec![outcome_log]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn unwritable_outcome_log_fails_before_launch() {
    let server = MockServer::start();
    let mock_endpoints = setup_mock_server_endpoints(&server);

    let configuration = common::build_configuration(vec![
        "--iterations",
        "3",
        "--outcome-log",
        "/nonexistent-directory/outcomes.log",
    ]);
    let result = common::build_load_test(
        common::build_definition(&server, &[INDEX_PATH]),
        configuration,
    )
    .run()
    .await;

    assert!(matches!(result, Err(stampede::StampedeError::Io(_))));
    assert_eq!(mock_endpoints[INDEX_KEY].hits(), 0);
}
