#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::{TempDir, tempdir};

fn gate_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_contract_gate"))
}

fn run_gate_command(args: &[&str], extra_env: &[(&str, &str)]) -> Output {
    let mut command = Command::new(gate_bin());
    command
        .args(args)
        .env_remove("CONTRACT_GATE_CONFIG")
        .env_remove("CONTRACT_GATE_ARTIFACT_ROOT")
        .env_remove("SQLMODEL_JSON");
    for (key, value) in extra_env {
        command.env(key, value);
    }

    command.output().expect("run contract_gate binary")
}

fn stdout_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn parse_stdout_json(output: &Output) -> Value {
    let text = stdout_text(output);
    let trimmed = text.trim();
    serde_json::from_str::<Value>(trimmed)
        .unwrap_or_else(|error| panic!("failed parsing JSON stdout ({trimmed}): {error}"))
}

fn parse_stderr_json(output: &Output) -> Value {
    let text = stderr_text(output);
    let trimmed = text.trim();
    serde_json::from_str::<Value>(trimmed)
        .unwrap_or_else(|error| panic!("failed parsing JSON stderr ({trimmed}): {error}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf-8 path")
}

/// A workspace with a config file pointing the exporter and runner at sh scripts.
struct Fixture {
    temp: TempDir,
}

impl Fixture {
    fn new(exporter_body: &str, runner_body: &str) -> Self {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(root.join("export.sh"), exporter_body).expect("write exporter script");
        fs::write(root.join("runner.sh"), runner_body).expect("write runner script");
        fs::write(
            root.join("gate.env"),
            format!(
                "exporter_command=sh\n\
                 exporter_args=\"{} {{output}}\"\n\
                 runner_command=sh\n\
                 runner_args=\"{} {{target}} {{junit}} {{coverage}}\"\n",
                root.join("export.sh").display(),
                root.join("runner.sh").display(),
            ),
        )
        .expect("write config");
        Self { temp }
    }

    fn root(&self) -> &Path {
        self.temp.path()
    }

    fn committed(&self) -> PathBuf {
        self.root().join("openapi").join("openapi.json")
    }

    fn artifacts(&self) -> PathBuf {
        self.root().join("artifacts")
    }

    fn write_committed(&self, content: &str) {
        let committed = self.committed();
        fs::create_dir_all(committed.parent().expect("parent")).expect("openapi dir");
        fs::write(committed, content).expect("write committed schema");
    }

    fn run(&self, command: &str, extra_args: &[&str], extra_env: &[(&str, &str)]) -> Output {
        let config = self.root().join("gate.env");
        let artifacts = self.artifacts();
        let mut args = vec![command];
        args.extend_from_slice(extra_args);
        args.extend_from_slice(&[
            "--config",
            path_str(&config),
            "--artifact-root",
            path_str(&artifacts),
        ]);
        run_gate_command(&args, extra_env)
    }

    fn gate(&self, extra_env: &[(&str, &str)]) -> Output {
        let committed = self.committed();
        self.run("gate", &[path_str(&committed)], extra_env)
    }
}

fn exporter_writing(document: &str) -> String {
    format!("cat > \"$1\" <<'EOF'\n{document}\nEOF\n")
}

const PASSING_RUNNER: &str = "echo 'collected 1 item'\necho '<testsuite/>' > \"$2\"\n";

#[test]
fn gate_passes_when_only_key_order_differs() {
    let fixture = Fixture::new(
        &exporter_writing(r#"{"info":{"title":"X"},"paths":{}}"#),
        PASSING_RUNNER,
    );
    fixture.write_committed(r#"{"paths":{},"info":{"title":"X"}}"#);

    let output = fixture.gate(&[]);
    assert!(
        output.status.success(),
        "gate should pass: {}",
        stderr_text(&output)
    );

    let contract = fixture.artifacts().join("contract");
    assert_eq!(
        fs::read_to_string(contract.join("schema.diff")).expect("diff artifact"),
        ""
    );
    assert!(contract.join("runtime-openapi.json").exists());
    assert!(contract.join("committed.normalized.json").exists());
    assert!(contract.join("runtime.normalized.json").exists());

    let meta: Value = serde_json::from_str(
        &fs::read_to_string(contract.join("gate_meta.json")).expect("read gate meta"),
    )
    .expect("parse gate meta");
    assert_eq!(meta["verdict"], "pass");
}

#[test]
fn gate_fails_on_drift_and_writes_diff() {
    let fixture = Fixture::new(
        &exporter_writing(r#"{"paths":{"/a":{"get":{}},"/b":{"get":{}}}}"#),
        PASSING_RUNNER,
    );
    fixture.write_committed(r#"{"paths":{"/a":{"get":{}}}}"#);

    let output = fixture.gate(&[]);
    assert_eq!(output.status.code(), Some(1));
    assert!(
        stderr_text(&output).contains("schema drift detected"),
        "unexpected stderr: {}",
        stderr_text(&output)
    );

    let diff = fs::read_to_string(fixture.artifacts().join("contract").join("schema.diff"))
        .expect("diff artifact");
    assert!(diff.contains("+    \"/b\": {"), "diff was: {diff}");
    assert!(diff.starts_with("--- committed/"));
}

#[test]
fn gate_blocks_without_baseline_and_never_exports() {
    let fixture = Fixture::new(
        "touch \"$(dirname \"$0\")/exporter-ran\"\necho '{}' > \"$1\"\n",
        PASSING_RUNNER,
    );

    let output = fixture.gate(&[("SQLMODEL_JSON", "1")]);
    assert_eq!(output.status.code(), Some(1));

    let payload = parse_stderr_json(&output);
    assert_eq!(payload["status"], "error");
    assert_eq!(payload["kind"], "missing_baseline");
    assert!(
        payload["error"]
            .as_str()
            .expect("error message")
            .contains("commit a baseline")
    );

    assert!(!fixture.root().join("exporter-ran").exists());
    assert!(
        !fixture
            .artifacts()
            .join("contract")
            .join("schema.diff")
            .exists()
    );
}

#[test]
fn gate_blocks_when_exporter_fails() {
    let fixture = Fixture::new(
        "echo 'ImportError: settings module missing' >&2\nexit 5\n",
        PASSING_RUNNER,
    );
    fixture.write_committed("{}");

    let output = fixture.gate(&[]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = stderr_text(&output);
    assert!(stderr.contains("schema export failed"), "stderr: {stderr}");
    assert!(stderr.contains("exit=5"), "stderr: {stderr}");
    assert!(stderr.contains("ImportError: settings module missing"));
}

#[test]
fn gate_reports_malformed_baseline_as_parse_error() {
    let fixture = Fixture::new(&exporter_writing("{}"), PASSING_RUNNER);
    fixture.write_committed("openapi: 3.0.0\n");

    let output = fixture.gate(&[]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_text(&output).contains("not valid JSON"));
}

#[test]
fn refresh_baseline_then_gate_passes() {
    let fixture = Fixture::new(
        &exporter_writing(r#"{"paths":{"/b":{}},"info":{"title":"Café"}}"#),
        PASSING_RUNNER,
    );

    let committed = fixture.committed();
    let refresh = fixture.run("refresh-baseline", &[path_str(&committed)], &[]);
    assert!(
        refresh.status.success(),
        "refresh failed: {}",
        stderr_text(&refresh)
    );
    assert_eq!(
        fs::read_to_string(&committed).expect("baseline"),
        "{\n  \"info\": {\n    \"title\": \"Café\"\n  },\n  \"paths\": {\n    \"/b\": {}\n  }\n}\n"
    );

    let gate = fixture.gate(&[]);
    assert!(gate.status.success(), "gate failed: {}", stderr_text(&gate));
}

#[test]
fn stage_failure_propagates_runner_status_and_extracts_traceback() {
    let fixture = Fixture::new(
        &exporter_writing("{}"),
        "echo 'collected 4 items'\necho 'Traceback (most recent call last): ValueError'\necho '1 failed, 3 passed'\nexit 2\n",
    );

    let output = fixture.run("stage", &["integration", "tests/integration"], &[]);
    assert_eq!(output.status.code(), Some(2));
    let echoed = format!("{}{}", stdout_text(&output), stderr_text(&output));
    assert!(echoed.contains("collected 4 items"));

    let stage_dir = fixture.artifacts().join("integration");
    assert_eq!(
        fs::read_to_string(stage_dir.join("failed-request-payloads.log")).expect("excerpt"),
        "Traceback (most recent call last): ValueError\n"
    );
    let log = fs::read_to_string(stage_dir.join("test-output.log")).expect("log");
    assert!(log.contains("1 failed, 3 passed"));
}

#[test]
fn stage_success_emits_json_summary_and_keeps_reports() {
    let fixture = Fixture::new(&exporter_writing("{}"), PASSING_RUNNER);

    let output = fixture.run("stage", &["unit", "tests/unit"], &[("SQLMODEL_JSON", "1")]);
    assert!(
        output.status.success(),
        "stage failed: {}",
        stderr_text(&output)
    );

    let payload = parse_stdout_json(&output);
    assert_eq!(payload["command"], "stage");
    assert_eq!(payload["status"], "passed");
    assert_eq!(payload["exit_code"], 0);
    assert!(payload["failure_excerpt"].is_null());

    let stage_dir = fixture.artifacts().join("unit");
    assert!(stage_dir.join("junit.xml").exists());
    assert!(!stage_dir.join("failed-request-payloads.log").exists());
    assert!(stderr_text(&output).contains("collected 1 item"));
}

#[test]
fn stage_rejects_nested_stage_names() {
    let fixture = Fixture::new(&exporter_writing("{}"), PASSING_RUNNER);

    let output = fixture.run("stage", &["../escape", "tests"], &[]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_text(&output).contains("stage name"));
    assert!(!fixture.root().join("escape").exists());
}
