//! Integration tests for the `pipeline-runtime` demonstration CLI.
//!
//! Each test runs the compiled binary as a subprocess and validates that:
//!   1. stdout contains valid JSON only (tracing logs go to stderr).
//!   2. The JSON contains `schema_version`, `ok`, and `type` fields.
//!   3. Command-specific fields are present and correct.

use std::path::PathBuf;
use std::process::Command;

/// Path to the compiled binary.
fn binary() -> PathBuf {
    // Prefer the current exe's directory (works inside cargo test).
    let mut p = std::env::current_exe().expect("current exe");
    p.pop(); // remove test binary name
             // In release mode there's no "deps" subdirectory; try both.
    if p.ends_with("deps") {
        p.pop();
    }
    // Binary name is "pipeline-runtime" as defined in [[bin]] of Cargo.toml.
    p.push("pipeline-runtime");
    if cfg!(windows) {
        p.set_extension("exe");
    }
    p
}

/// Run the binary with `args`, returning the parsed stdout JSON. Panics with
/// a descriptive message if stdout isn't valid JSON.
fn run_cli(args: &[&str]) -> serde_json::Value {
    let output = Command::new(binary())
        .args(args)
        .output()
        .expect("spawn pipeline-runtime binary");
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).unwrap_or_else(|e| {
        panic!(
            "stdout was not valid JSON: {e}\nstdout: {stdout}\nstderr: {}",
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

#[test]
fn parse_json_round_trips_without_interpolation_placeholders() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("pipeline.json");
    std::fs::write(
        &file,
        r#"{"env":{"TEAM1":"England","HEADLINE":"${TEAM1} vs ${TEAM2} in ${YEAR}"},"steps":[{"command":"echo ${HEADLINE}"}]}"#,
    )
    .unwrap();

    let json = run_cli(&[
        "parse",
        file.to_str().unwrap(),
        "--env",
        "YEAR=1912",
        "--env",
        "TEAM2=Australia",
    ]);

    assert_eq!(json["ok"], true);
    assert_eq!(json["type"], "parse");
    let command = json["tree"]["steps"][0]["command"].as_str().unwrap();
    assert_eq!(command, "echo England vs Australia in 1912");
}

#[test]
fn parse_yaml_infers_format_and_wraps_bare_sequence() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("pipeline.yaml");
    std::fs::write(&file, "- label: \"hello ${FRIEND}\"\n").unwrap();

    let json = run_cli(&["parse", file.to_str().unwrap(), "--env", "FRIEND=friend"]);

    assert_eq!(json["ok"], true);
    let label = json["tree"]["steps"][0]["label"].as_str().unwrap();
    assert_eq!(label, "hello friend");
}

#[test]
fn parse_no_interpolation_leaves_placeholders_untouched() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("pipeline.yaml");
    std::fs::write(&file, "steps:\n  - label: \"${UNSET}\"\n").unwrap();

    let json = run_cli(&["parse", file.to_str().unwrap(), "--no-interpolation"]);

    let label = json["tree"]["steps"][0]["label"].as_str().unwrap();
    assert_eq!(label, "${UNSET}");
}

#[test]
fn parse_strict_reference_to_missing_variable_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("pipeline.yaml");
    std::fs::write(&file, "steps:\n  - label: \"${MISSING?}\"\n").unwrap();

    let output = Command::new(binary())
        .args(["parse", file.to_str().unwrap()])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let json: serde_json::Value =
        serde_json::from_str(String::from_utf8_lossy(&output.stdout).trim()).unwrap();
    assert_eq!(json["ok"], false);
    assert_eq!(json["type"], "error");
}

#[test]
fn parse_missing_file_reports_an_error_envelope() {
    let output = Command::new(binary())
        .args(["parse", "/nonexistent/path/pipeline.yaml"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let json: serde_json::Value =
        serde_json::from_str(String::from_utf8_lossy(&output.stdout).trim()).unwrap();
    assert_eq!(json["ok"], false);
}

#[test]
fn run_captures_output_and_exit_status() {
    let tmp = tempfile::tempdir().unwrap();
    let log = tmp.path().join("run.log");

    let json = run_cli(&[
        "run",
        "--log",
        log.to_str().unwrap(),
        "--",
        "sh",
        "-c",
        "echo hello-from-child",
    ]);

    assert_eq!(json["ok"], true);
    assert_eq!(json["type"], "run");
    assert_eq!(json["exit_status"], "0");
    assert!(json["output"].as_str().unwrap().contains("hello-from-child"));
    assert_eq!(json["failed_chunks"], 0);

    let logged = std::fs::read_to_string(&log).unwrap();
    assert!(logged.contains("hello-from-child"));
}

#[test]
fn run_reports_nonzero_exit_status() {
    let tmp = tempfile::tempdir().unwrap();
    let log = tmp.path().join("run.log");

    let json = run_cli(&[
        "run",
        "--log",
        log.to_str().unwrap(),
        "--",
        "sh",
        "-c",
        "exit 4",
    ]);

    assert_eq!(json["exit_status"], "4");
}

#[test]
fn run_reassembles_chunked_log_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let log = tmp.path().join("run.log");

    let json = run_cli(&[
        "run",
        "--log",
        log.to_str().unwrap(),
        "--max-chunk-bytes",
        "4",
        "--concurrency",
        "3",
        "--",
        "sh",
        "-c",
        "printf 'llamas\\nalpaca\\n'",
    ]);

    assert_eq!(json["ok"], true);
    let logged = std::fs::read_to_string(&log).unwrap();
    assert_eq!(logged, "llamas\nalpaca\n");
}
