use gumdrop::Options;
use httpmock::MockServer;
use std::io::{self, BufRead};

use stampede::config::StampedeConfiguration;
use stampede::metrics::RunSummary;
use stampede::workload::{ActionDefinition, CheckDefinition, WorkloadDefinition};
use stampede::LoadTest;

/// Not all functions are used by all tests, so we enable allow(dead_code) to avoid
/// compiler warnings during testing.

/// The following options are configured by default, if not set to a custom value:
///  --users 1
///  --no-ctrlc
pub fn build_configuration(custom: Vec<&str>) -> StampedeConfiguration {
    // Start with an empty configuration.
    let mut configuration: Vec<&str> = vec![];

    // Merge in all custom options first.
    configuration.extend_from_slice(&custom);

    // Default to testing with 1 user if not otherwise configured.
    if !configuration.contains(&"--users") {
        configuration.extend_from_slice(&["--users", "1"]);
    }

    // Tests that send SIGINT opt in to ctrl-c handling explicitly.
    if !configuration.contains(&"--ctrlc") {
        configuration.push("--no-ctrlc");
    } else {
        configuration.retain(|option| *option != "--ctrlc");
    }

    // Parse these options to generate a StampedeConfiguration.
    StampedeConfiguration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// A workload that requests each of `paths` on the mock server, checking for a 200.
#[allow(dead_code)]
pub fn build_definition(server: &MockServer, paths: &[&str]) -> WorkloadDefinition {
    let mut definition = WorkloadDefinition::new(1, 0);
    for path in paths {
        definition = definition.register_action(
            ActionDefinition::get(&server.url(*path))
                .register_check(CheckDefinition::status("status is 200", 200)),
        );
    }
    definition
}

/// Create a LoadTest from the workload definition and configuration.
#[allow(dead_code)]
pub fn build_load_test(
    definition: WorkloadDefinition,
    configuration: StampedeConfiguration,
) -> LoadTest {
    LoadTest::initialize_with_config(definition, configuration).unwrap()
}

/// Run the actual load test, returning the RunSummary.
#[allow(dead_code)]
pub async fn run_load_test(load_test: LoadTest) -> RunSummary {
    load_test.run().await.unwrap()
}

/// Helper to count the number of lines in a test artifact.
#[allow(dead_code)]
pub fn file_length(file_name: &str) -> usize {
    if let Ok(file) = std::fs::File::open(std::path::Path::new(file_name)) {
        io::BufReader::new(file).lines().count()
    } else {
        0
    }
}

/// Helper to delete test artifacts, if existing.
#[allow(dead_code)]
pub fn cleanup_files(files: Vec<&str>) {
    for file in files {
        if std::path::Path::new(file).exists() {
            std::fs::remove_file(file).expect("failed to remove file");
        }
    }
}
