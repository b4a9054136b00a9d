//! CLI integration tests for startup validation.
//!
//! These tests spawn the lichen binary as a subprocess to verify that bad
//! configuration fails the run with the expected message and that an empty
//! service list still produces a clean, empty report.

use std::io::Write;
use std::process::{Command, Output};

use rstest::rstest;
use tempfile::NamedTempFile;

/// Returns the path to the built binary.
fn binary_path() -> std::path::PathBuf {
    // cargo test builds binaries in target/debug
    let mut path = std::env::current_exe()
        .unwrap_or_else(|error| panic!("failed to get current exe path: {error}"));
    path.pop(); // remove test binary name
    path.pop(); // remove deps
    path.push("lichen");
    path
}

fn run_lichen(args: &[&str]) -> Output {
    let mut command = Command::new(binary_path());
    command.args(args);
    command
        .output()
        .unwrap_or_else(|error| panic!("failed to execute binary: {error}"))
}

/// Writes a config file the spawned binary can load.
#[expect(
    clippy::expect_used,
    reason = "integration test setup; allow-expect-in-tests does not cover integration tests"
)]
fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("should create temp config");
    file.write_all(content.as_bytes())
        .expect("should write temp config");
    file
}

/// Asserts that the run fails and stderr carries the expected message.
fn assert_startup_error(args: &[&str], expected_stderr: &str) {
    let output = run_lichen(args);

    assert!(
        !output.status.success(),
        "should fail with '{expected_stderr}'"
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains(expected_stderr),
        "stderr should contain '{expected_stderr}': {stderr}"
    );
}

#[rstest]
fn missing_config_file_fails_the_run() {
    assert_startup_error(
        &["-c", "/nonexistent/lichen.toml"],
        "No config file found at /nonexistent/lichen.toml",
    );
}

#[rstest]
fn empty_service_list_prints_an_empty_report() {
    let config = write_config("git_services = []\n");
    let path = config.path().to_string_lossy().into_owned();

    let output = run_lichen(&["-c", &path]);

    assert!(output.status.success(), "empty service list should succeed");
    assert!(
        output.stdout.is_empty(),
        "report should be empty: {}",
        String::from_utf8_lossy(&output.stdout)
    );
}

#[rstest]
fn insecure_and_certificate_flags_conflict() {
    let config = write_config("git_services = []\n");
    let path = config.path().to_string_lossy().into_owned();

    assert_startup_error(
        &["-c", &path, "-k", "--cacert", "/tmp/bundle.pem"],
        "Certificate file can't be used with insecure flag",
    );
}

#[rstest]
fn oneline_format_rejects_the_last_comment_option() {
    let config = write_config("git_services = []\n");
    let path = config.path().to_string_lossy().into_owned();

    assert_startup_error(
        &["-c", &path, "-f", "oneline", "--show-last-comment"],
        "oneline format doesn't support last comment functionality",
    );
}

#[rstest]
fn unknown_service_type_fails_the_run() {
    let config = write_config("[[git_services]]\ntype = \"bitbucket\"\n");
    let path = config.path().to_string_lossy().into_owned();

    assert_startup_error(
        &["-c", &path],
        "requested git service bitbucket is not valid",
    );
}

#[rstest]
fn malformed_age_expression_fails_the_run() {
    let config = write_config("git_services = []\n");
    let path = config.path().to_string_lossy().into_owned();

    assert_startup_error(
        &["-c", &path, "--age", "sometime", "2y"],
        "Wrong or missing state, only older/newer is allowed",
    );
}

#[rstest]
fn email_output_requires_mailer_configuration() {
    let config = write_config("git_services = []\n");
    let path = config.path().to_string_lossy().into_owned();

    assert_startup_error(
        &["-c", &path, "--email", "dev@example.com"],
        "Missing mailer configuration. Check demos/sampleinput_email.toml",
    );
}
