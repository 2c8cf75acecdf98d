//! Test stage runner.
//!
//! Runs the configured test program once for a named stage, echoing its
//! output live while teeing both streams into `<stage>/test-output.log`. The
//! stage exits with the runner's own status. On failure the log is scanned for
//! diagnostic markers and the matches land in
//! `<stage>/failed-request-payloads.log`; triage problems never change the
//! stage outcome.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use clap::Args;
use serde_json::json;

use crate::config::{ConfigArgs, StageConfig};
use crate::error::{GateError, Result};
use crate::extract::{FailureExcerpt, extract_bytes};
use crate::runmeta::{EvidenceLedger, StageMeta, new_trace_id};
use crate::util::{
    CliOutput, OutputIntegration, expand_template, now_utc_iso, output_for, reset_dir,
    validate_stage_name,
};

pub const JUNIT_FILE: &str = "junit.xml";
pub const COVERAGE_FILE: &str = "coverage.xml";
pub const TEST_LOG_FILE: &str = "test-output.log";
pub const FAILURE_EXCERPT_FILE: &str = "failed-request-payloads.log";
pub const STAGE_META_FILE: &str = "stage_meta.json";
pub const LEDGER_FILE: &str = "evidence_ledger.jsonl";

const PUMP_BUFFER_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Args)]
pub struct StageArgs {
    /// Stage name; artifacts go under `<artifact-root>/<stage>/`.
    pub stage: String,

    /// Test target handed to the runner as `{target}`.
    pub target: String,

    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Debug, Clone)]
pub struct StageArtifacts {
    pub dir: PathBuf,
    pub junit: PathBuf,
    pub coverage: PathBuf,
    pub log: PathBuf,
    pub failure_excerpt: PathBuf,
    pub meta: PathBuf,
    pub ledger: PathBuf,
}

impl StageArtifacts {
    #[must_use]
    pub fn in_dir(dir: PathBuf) -> Self {
        Self {
            junit: dir.join(JUNIT_FILE),
            coverage: dir.join(COVERAGE_FILE),
            log: dir.join(TEST_LOG_FILE),
            failure_excerpt: dir.join(FAILURE_EXCERPT_FILE),
            meta: dir.join(STAGE_META_FILE),
            ledger: dir.join(LEDGER_FILE),
            dir,
        }
    }
}

/// Outcome of one stage run.
#[derive(Debug, Clone)]
pub struct TestStageArtifact {
    pub stage: String,
    pub exit_status: i32,
    pub artifacts: StageArtifacts,
    pub excerpt: Option<FailureExcerpt>,
    /// Set when teeing the runner output was incomplete.
    pub capture_error: Option<String>,
}

impl TestStageArtifact {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.exit_status == 0
    }
}

/// Exit code of a finished child; a signal death maps to 128 + signal.
#[must_use]
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Copy `source` to `console` and the shared log until EOF.
///
/// Write failures are remembered but never stop the drain, so the child can
/// not block on a full pipe.
fn pump(
    mut source: impl Read,
    mut console: impl Write,
    log: &Mutex<File>,
    stream: &str,
) -> Option<String> {
    let mut buffer = [0_u8; PUMP_BUFFER_BYTES];
    let mut first_error = None;

    loop {
        let read = match source.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(error) if error.kind() == ErrorKind::Interrupted => continue,
            Err(error) => {
                first_error.get_or_insert(format!("{stream}: read failed: {error}"));
                break;
            }
        };
        let chunk = &buffer[..read];

        if let Err(error) = console.write_all(chunk).and_then(|()| console.flush()) {
            first_error.get_or_insert(format!("{stream}: console echo failed: {error}"));
        }
        let logged = match log.lock() {
            Ok(mut file) => file.write_all(chunk).map_err(|error| error.to_string()),
            Err(_) => Err("log lock poisoned".to_string()),
        };
        if let Err(error) = logged {
            first_error.get_or_insert(format!("{stream}: log write failed: {error}"));
        }
    }

    first_error
}

fn spawn_pump<R, W>(
    source: Option<R>,
    console: W,
    log: Arc<Mutex<File>>,
    stream: &'static str,
) -> Option<thread::JoinHandle<Option<String>>>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    source.map(|source| thread::spawn(move || pump(source, console, &log, stream)))
}

fn join_pump(handle: Option<thread::JoinHandle<Option<String>>>) -> Option<String> {
    handle.and_then(|handle| {
        handle
            .join()
            .unwrap_or_else(|_| Some("output pump panicked".to_string()))
    })
}

/// Build the runner invocation for a stage.
#[must_use]
pub fn runner_command_line(config: &StageConfig, artifacts: &StageArtifacts) -> Vec<String> {
    expand_template(
        &config.runner.args_template,
        &[
            ("target", config.target.clone()),
            ("junit", artifacts.junit.display().to_string()),
            ("coverage", artifacts.coverage.display().to_string()),
            ("stage", config.stage.clone()),
            ("artifact_dir", artifacts.dir.display().to_string()),
        ],
    )
}

struct Captured {
    exit_status: i32,
    capture_error: Option<String>,
}

fn run_and_tee(
    config: &StageConfig,
    args: &[String],
    log_path: &Path,
    echo_stdout_to_stderr: bool,
) -> Result<Captured> {
    let log_file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(log_path)?;
    let log = Arc::new(Mutex::new(log_file));

    let mut child = Command::new(&config.runner.program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| match error.kind() {
            ErrorKind::NotFound => GateError::MissingCommand {
                command: config.runner.program.clone(),
            },
            _ => GateError::Io(error),
        })?;

    let stdout_console: Box<dyn Write + Send> = if echo_stdout_to_stderr {
        Box::new(std::io::stderr())
    } else {
        Box::new(std::io::stdout())
    };
    let stdout_pump = spawn_pump(child.stdout.take(), stdout_console, Arc::clone(&log), "stdout");
    let stderr_pump = spawn_pump(child.stderr.take(), std::io::stderr(), Arc::clone(&log), "stderr");

    let status = child.wait()?;
    let errors = [join_pump(stdout_pump), join_pump(stderr_pump)]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

    if let Ok(mut file) = log.lock() {
        let _ = file.flush();
    }

    Ok(Captured {
        exit_status: exit_code_of(status),
        capture_error: (!errors.is_empty()).then(|| errors.join("; ")),
    })
}

/// Run one stage and persist its artifacts.
///
/// Returns `Ok` for any runner exit status; callers decide what a nonzero
/// status means. Errors are reserved for the stage never having run.
pub fn run_test_stage(
    config: &StageConfig,
    ui: &CliOutput,
    echo_stdout_to_stderr: bool,
) -> Result<TestStageArtifact> {
    validate_stage_name(&config.stage)?;

    let artifacts = StageArtifacts::in_dir(config.stage_dir());
    reset_dir(&artifacts.dir)?;

    let mut ledger = EvidenceLedger::open(
        artifacts.ledger.clone(),
        new_trace_id(&config.stage),
        config.evidence_ledger,
    )?;
    let args = runner_command_line(config, &artifacts);
    let mut runner_command = vec![config.runner.program.clone()];
    runner_command.extend(args.iter().cloned());

    let mut meta = StageMeta {
        stage: config.stage.clone(),
        target: config.target.clone(),
        status: "running".to_string(),
        started_at: now_utc_iso(),
        runner_command,
        log: artifacts.log.display().to_string(),
        junit: artifacts.junit.display().to_string(),
        coverage: artifacts.coverage.display().to_string(),
        trace_id: ledger.trace_id().to_string(),
        evidence_ledger: ledger.path().map(|path| path.display().to_string()),
        ..StageMeta::default()
    };

    let started = Instant::now();
    let captured = match run_and_tee(config, &args, &artifacts.log, echo_stdout_to_stderr) {
        Ok(captured) => captured,
        Err(error) => {
            meta.status = "error".to_string();
            meta.finished_at = Some(now_utc_iso());
            meta.capture_error = Some(error.to_string());
            write_meta(&meta, &artifacts, ui);
            record(&mut ledger, ui, "run_tests", vec![format!("error={error}")]);
            return Err(error);
        }
    };
    // From here on the runner's status is the outcome; bookkeeping only warns.
    let exit_status = captured.exit_status;
    record(
        &mut ledger,
        ui,
        "run_tests",
        vec![
            format!("exit_code={exit_status}"),
            format!("capture_ok={}", captured.capture_error.is_none()),
        ],
    );
    if let Some(error) = &captured.capture_error {
        ui.warning(&format!("output capture incomplete: {error}"));
    }

    let excerpt = if exit_status == 0 {
        None
    } else {
        triage_failure(config, &artifacts, ui, &mut ledger)
    };

    meta.status = if exit_status == 0 { "passed" } else { "failed" }.to_string();
    meta.finished_at = Some(now_utc_iso());
    meta.duration_seconds = i64::try_from(started.elapsed().as_secs()).ok();
    meta.exit_code = Some(exit_status);
    meta.capture_error = captured.capture_error.clone();
    meta.junit_exists = Some(artifacts.junit.exists());
    meta.coverage_exists = Some(artifacts.coverage.exists());
    if let Some(excerpt) = &excerpt {
        meta.failure_excerpt = Some(artifacts.failure_excerpt.display().to_string());
        meta.failure_excerpt_lines = Some(excerpt.len());
    }
    write_meta(&meta, &artifacts, ui);
    record(
        &mut ledger,
        ui,
        "stage_complete",
        vec![format!("status={}", meta.status), format!("exit_code={exit_status}")],
    );

    Ok(TestStageArtifact {
        stage: config.stage.clone(),
        exit_status,
        artifacts,
        excerpt,
        capture_error: captured.capture_error,
    })
}

fn write_meta(meta: &StageMeta, artifacts: &StageArtifacts, ui: &CliOutput) {
    if let Err(error) = meta.write_to_path(&artifacts.meta) {
        ui.warning(&format!(
            "could not write {}: {error}",
            artifacts.meta.display()
        ));
    }
}

fn record(ledger: &mut EvidenceLedger, ui: &CliOutput, action: &str, terms: Vec<String>) {
    if let Err(error) = ledger.record(action, terms) {
        ui.warning(&format!("evidence ledger write failed: {error}"));
    }
}

/// Best effort: every failure here is reported and swallowed.
fn triage_failure(
    config: &StageConfig,
    artifacts: &StageArtifacts,
    ui: &CliOutput,
    ledger: &mut EvidenceLedger,
) -> Option<FailureExcerpt> {
    let log_bytes = match std::fs::read(&artifacts.log) {
        Ok(bytes) => bytes,
        Err(error) => {
            ui.warning(&format!("failure triage skipped: cannot read log: {error}"));
            return None;
        }
    };

    let excerpt = extract_bytes(&log_bytes, &config.markers);
    if let Err(error) = excerpt.write_to(&artifacts.failure_excerpt) {
        ui.warning(&format!("failure triage could not write excerpt: {error}"));
        return None;
    }
    record(
        ledger,
        ui,
        "extract_failures",
        vec![
            format!("matched_lines={}", excerpt.len()),
            format!("categories={}", config.markers.categories().join(",")),
        ],
    );
    Some(excerpt)
}

pub fn run_stage(args: StageArgs) -> Result<()> {
    let integration = OutputIntegration::detect();
    let ui = output_for(&integration);

    validate_stage_name(&args.stage)?;
    let values = args.config.load()?;
    let config = StageConfig::resolve(
        &values,
        args.stage,
        args.target,
        args.config.artifact_root.clone(),
    )?;

    ui.rule(Some(&format!("contract_gate stage {}", config.stage)));
    ui.info(&format!("target={}", config.target));
    ui.info(&format!("runner={}", config.runner.label()));
    ui.info(&format!("artifacts={}", config.stage_dir().display()));

    let outcome = run_test_stage(&config, &ui, integration.should_emit_json())?;

    if outcome.passed() {
        ui.success(&format!("stage {} passed", outcome.stage));
    } else {
        ui.error(&format!(
            "stage {} failed (exit={})",
            outcome.stage, outcome.exit_status
        ));
        if let Some(excerpt) = &outcome.excerpt {
            ui.info(&format!(
                "failure excerpt: {} ({} lines)",
                outcome.artifacts.failure_excerpt.display(),
                excerpt.len()
            ));
        }
    }

    if integration.should_emit_json() {
        println!(
            "{}",
            json!({
                "command": "stage",
                "stage": outcome.stage,
                "status": if outcome.passed() { "passed" } else { "failed" },
                "exit_code": outcome.exit_status,
                "log": outcome.artifacts.log.display().to_string(),
                "junit": outcome.artifacts.junit.display().to_string(),
                "coverage": outcome.artifacts.coverage.display().to_string(),
                "failure_excerpt": outcome
                    .excerpt
                    .as_ref()
                    .map(|_| outcome.artifacts.failure_excerpt.display().to_string()),
                "capture_error": outcome.capture_error,
                "integration": integration,
            })
        );
    }

    if outcome.passed() {
        Ok(())
    } else {
        Err(GateError::StageFailed {
            stage: outcome.stage,
            exit_code: outcome.exit_status,
        })
    }
}
