//! Schema contract gate.
//!
//! One invocation walks CheckBaseline, ExportRuntime, Normalize, Diff and
//! Decide exactly once. A missing baseline or a failed export blocks the gate
//! before any comparison; a malformed schema is a hard error; a non-empty diff
//! fails it. The diff artifact is written on every run that reaches Diff.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use clap::Args;
use serde::Serialize;

use crate::config::{CommandSpec, ConfigArgs, GateConfig};
use crate::diff::{DiffResult, diff};
use crate::error::{GateError, Result};
use crate::normalize::normalize_to;
use crate::runmeta::{EvidenceLedger, GateMeta, new_trace_id};
use crate::util::{
    CliOutput, OutputIntegration, display_relative, ensure_dir, expand_template, now_utc_iso,
    output_for, remove_if_exists, validate_stage_name, write_string,
};

pub const RUNTIME_SCHEMA_FILE: &str = "runtime-openapi.json";
pub const COMMITTED_NORMALIZED_FILE: &str = "committed.normalized.json";
pub const RUNTIME_NORMALIZED_FILE: &str = "runtime.normalized.json";
pub const DIFF_FILE: &str = "schema.diff";
pub const EXPORT_LOG_FILE: &str = "export.log";
pub const GATE_META_FILE: &str = "gate_meta.json";
pub const LEDGER_FILE: &str = "evidence_ledger.jsonl";

#[derive(Debug, Clone, Args)]
pub struct GateArgs {
    /// Committed schema to compare against (defaults to `committed_schema`).
    pub committed_path: Option<PathBuf>,

    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Debug, Clone, Args)]
pub struct RefreshBaselineArgs {
    /// Baseline file to overwrite (defaults to `committed_schema`).
    pub committed_path: Option<PathBuf>,

    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum GateVerdict {
    Pass,
    Fail(String),
    Blocked(String),
}

impl GateVerdict {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail(_) => "fail",
            Self::Blocked(_) => "blocked",
        }
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Pass => None,
            Self::Fail(reason) | Self::Blocked(reason) => Some(reason),
        }
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if matches!(self, Self::Pass) { 0 } else { 1 }
    }
}

/// Why an export did not produce a usable runtime schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportFailure {
    pub command: String,
    pub exit_code: i32,
    pub detail: String,
}

/// Produces the runtime schema document at a destination path.
pub trait SchemaExporter {
    fn describe(&self) -> String;

    fn export(&self, destination: &Path) -> std::result::Result<(), ExportFailure>;
}

/// Runs the configured exporter program, capturing its output to a log file.
#[derive(Debug, Clone)]
pub struct CommandExporter {
    pub spec: CommandSpec,
    pub log_path: PathBuf,
}

impl CommandExporter {
    #[must_use]
    pub fn args_for(&self, destination: &Path) -> Vec<String> {
        let output = destination.display().to_string();
        let mut args = expand_template(&self.spec.args_template, &[("output", output.clone())]);
        if !self.spec.args_template.contains("{output}") {
            args.push(output);
        }
        args
    }
}

impl SchemaExporter for CommandExporter {
    fn describe(&self) -> String {
        self.spec.label()
    }

    fn export(&self, destination: &Path) -> std::result::Result<(), ExportFailure> {
        let failure = |exit_code: i32, detail: String| ExportFailure {
            command: self.describe(),
            exit_code,
            detail,
        };

        let output = Command::new(&self.spec.program)
            .args(self.args_for(destination))
            .output()
            .map_err(|error| failure(127, format!("could not start exporter: {error}")))?;

        if let Ok(mut log) = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.log_path)
        {
            let _ = log.write_all(&output.stdout);
            let _ = log.write_all(&output.stderr);
        }

        if output.status.success() {
            return Ok(());
        }

        let _ = std::io::stderr().write_all(&output.stderr);
        let exit_code = output.status.code().unwrap_or(1);
        Err(failure(exit_code, last_diagnostic_line(&output.stderr, &output.stdout)))
    }
}

fn last_diagnostic_line(stderr: &[u8], stdout: &[u8]) -> String {
    [stderr, stdout]
        .iter()
        .find_map(|stream| {
            String::from_utf8_lossy(stream)
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(ToOwned::to_owned)
        })
        .unwrap_or_else(|| "exporter exited with a failure status".to_string())
}

/// Artifact paths for one gate invocation.
#[derive(Debug, Clone, Serialize)]
pub struct GateArtifacts {
    pub dir: PathBuf,
    pub runtime_schema: PathBuf,
    pub committed_normalized: PathBuf,
    pub runtime_normalized: PathBuf,
    pub diff: PathBuf,
    pub export_log: PathBuf,
    pub meta: PathBuf,
    pub ledger: PathBuf,
}

impl GateArtifacts {
    #[must_use]
    pub fn in_dir(dir: PathBuf) -> Self {
        Self {
            runtime_schema: dir.join(RUNTIME_SCHEMA_FILE),
            committed_normalized: dir.join(COMMITTED_NORMALIZED_FILE),
            runtime_normalized: dir.join(RUNTIME_NORMALIZED_FILE),
            diff: dir.join(DIFF_FILE),
            export_log: dir.join(EXPORT_LOG_FILE),
            meta: dir.join(GATE_META_FILE),
            ledger: dir.join(LEDGER_FILE),
            dir,
        }
    }

    fn clear_previous_run(&self) -> Result<()> {
        for path in [
            &self.runtime_schema,
            &self.committed_normalized,
            &self.runtime_normalized,
            &self.diff,
            &self.export_log,
        ] {
            remove_if_exists(path)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GateReport {
    pub verdict: GateVerdict,
    pub committed_schema: PathBuf,
    pub artifacts: GateArtifacts,
    pub diff: Option<DiffResult>,
    pub export_failure: Option<ExportFailure>,
}

impl GateReport {
    /// The error a non-passing verdict surfaces as.
    #[must_use]
    pub fn to_error(&self) -> Option<GateError> {
        match &self.verdict {
            GateVerdict::Pass => None,
            GateVerdict::Blocked(_) => Some(match &self.export_failure {
                Some(failure) => GateError::ExportFailed {
                    command: failure.command.clone(),
                    exit_code: failure.exit_code,
                    detail: failure.detail.clone(),
                },
                None => GateError::MissingBaseline {
                    path: self.committed_schema.clone(),
                },
            }),
            GateVerdict::Fail(_) => {
                let (added, removed) = self
                    .diff
                    .as_ref()
                    .map_or((0, 0), |result| (result.added(), result.removed()));
                Some(GateError::SchemaDrift {
                    diff_path: self.artifacts.diff.clone(),
                    added,
                    removed,
                })
            }
        }
    }
}

/// Run the gate state machine once and persist its artifacts.
pub fn evaluate(config: &GateConfig, exporter: &dyn SchemaExporter) -> Result<GateReport> {
    validate_stage_name(&config.gate_stage)?;
    let artifacts = GateArtifacts::in_dir(config.gate_dir());
    ensure_dir(&artifacts.dir)?;
    artifacts.clear_previous_run()?;

    let mut ledger = EvidenceLedger::open(
        artifacts.ledger.clone(),
        new_trace_id("gate"),
        config.evidence_ledger,
    )?;
    let mut meta = GateMeta {
        verdict: "running".to_string(),
        started_at: now_utc_iso(),
        committed_schema: config.committed_schema.display().to_string(),
        runtime_schema: artifacts.runtime_schema.display().to_string(),
        exporter_command: exporter.describe(),
        trace_id: ledger.trace_id().to_string(),
        evidence_ledger: ledger.path().map(|path| path.display().to_string()),
        ..GateMeta::default()
    };

    let result = walk_states(config, exporter, &artifacts, &mut ledger, &mut meta);

    meta.finished_at = Some(now_utc_iso());
    match &result {
        Ok(report) => {
            meta.verdict = report.verdict.label().to_string();
            meta.reason = report.verdict.reason().map(ToOwned::to_owned);
        }
        Err(error) => {
            meta.verdict = "error".to_string();
            meta.reason = Some(error.to_string());
            ledger.record(
                "gate_error",
                vec![format!("kind={}", error.kind()), format!("error={error}")],
            )?;
        }
    }
    meta.write_to_path(&artifacts.meta)?;

    result
}

fn walk_states(
    config: &GateConfig,
    exporter: &dyn SchemaExporter,
    artifacts: &GateArtifacts,
    ledger: &mut EvidenceLedger,
    meta: &mut GateMeta,
) -> Result<GateReport> {
    let report = |verdict: GateVerdict,
                  diff: Option<DiffResult>,
                  export_failure: Option<ExportFailure>| GateReport {
        verdict,
        committed_schema: config.committed_schema.clone(),
        artifacts: artifacts.clone(),
        diff,
        export_failure,
    };

    let baseline_exists = config.committed_schema.is_file();
    ledger.record(
        "check_baseline",
        vec![
            format!("committed_schema={}", config.committed_schema.display()),
            format!("exists={baseline_exists}"),
        ],
    )?;
    if !baseline_exists {
        return Ok(report(
            GateVerdict::Blocked("missing baseline".to_string()),
            None,
            None,
        ));
    }

    let exported = exporter
        .export(&artifacts.runtime_schema)
        .and_then(|()| verify_export_output(exporter, &artifacts.runtime_schema));
    meta.exporter_exit_code = Some(match &exported {
        Ok(()) => 0,
        Err(failure) => failure.exit_code,
    });
    ledger.record(
        "export_runtime",
        vec![
            format!("command={}", exporter.describe()),
            format!("exit_code={}", meta.exporter_exit_code.unwrap_or(0)),
            format!("ok={}", exported.is_ok()),
        ],
    )?;
    if let Err(failure) = exported {
        return Ok(report(
            GateVerdict::Blocked("export failed".to_string()),
            None,
            Some(failure),
        ));
    }

    let committed = normalize_to(&config.committed_schema, &artifacts.committed_normalized)?;
    let runtime = normalize_to(&artifacts.runtime_schema, &artifacts.runtime_normalized)?;
    meta.committed_digest = Some(committed.digest());
    meta.runtime_digest = Some(runtime.digest());
    ledger.record(
        "normalize",
        vec![
            format!("committed_sha256={}", committed.digest()),
            format!("runtime_sha256={}", runtime.digest()),
        ],
    )?;

    let result = diff(&committed, &runtime);
    let rendered = result.render(
        &format!("committed/{}", config.committed_schema.display()),
        &format!("runtime/{RUNTIME_SCHEMA_FILE}"),
    );
    write_string(&artifacts.diff, &rendered)?;
    meta.diff_path = Some(artifacts.diff.display().to_string());
    meta.added_lines = Some(result.added());
    meta.removed_lines = Some(result.removed());
    ledger.record(
        "diff",
        vec![
            format!("added={}", result.added()),
            format!("removed={}", result.removed()),
            format!("hunks={}", result.hunks.len()),
        ],
    )?;

    let verdict = if result.is_empty() {
        GateVerdict::Pass
    } else {
        GateVerdict::Fail("schema drift".to_string())
    };
    ledger.record("decide", vec![format!("verdict={}", verdict.label())])?;
    Ok(report(verdict, Some(result), None))
}

fn verify_export_output(
    exporter: &dyn SchemaExporter,
    destination: &Path,
) -> std::result::Result<(), ExportFailure> {
    let size = std::fs::metadata(destination).map(|meta| meta.len()).ok();
    match size {
        Some(size) if size > 0 => Ok(()),
        Some(_) => Err(ExportFailure {
            command: exporter.describe(),
            exit_code: 0,
            detail: format!("exporter wrote an empty schema to {}", destination.display()),
        }),
        None => Err(ExportFailure {
            command: exporter.describe(),
            exit_code: 0,
            detail: format!("exporter produced no schema at {}", destination.display()),
        }),
    }
}

fn gate_config(config: &ConfigArgs, committed_path: Option<PathBuf>) -> Result<GateConfig> {
    let values = config.load()?;
    GateConfig::resolve(&values, committed_path, config.artifact_root.clone())
}

fn report_outcome(ui: &CliOutput, config: &GateConfig, report: &GateReport) {
    let root = &config.artifact_root;
    match &report.verdict {
        GateVerdict::Pass => ui.success("schema contract matches the committed baseline"),
        GateVerdict::Fail(reason) => {
            let (added, removed) = report
                .diff
                .as_ref()
                .map_or((0, 0), |result| (result.added(), result.removed()));
            ui.error(&format!("{reason}: +{added} -{removed}"));
            ui.info(&format!(
                "diff: {}",
                display_relative(root, &report.artifacts.diff)
            ));
        }
        GateVerdict::Blocked(reason) => {
            ui.error(&format!("gate blocked: {reason}"));
            if report.export_failure.is_none() {
                ui.info("commit a baseline schema before enabling the gate");
            }
        }
    }
}

pub fn run_gate(args: GateArgs) -> Result<()> {
    let integration = OutputIntegration::detect();
    let ui = output_for(&integration);

    let config = gate_config(&args.config, args.committed_path)?;
    let exporter = CommandExporter {
        spec: config.exporter.clone(),
        log_path: config.gate_dir().join(EXPORT_LOG_FILE),
    };

    ui.rule(Some("contract_gate gate"));
    ui.info(&format!("committed={}", config.committed_schema.display()));
    ui.info(&format!("exporter={}", exporter.describe()));
    ui.info(&format!("artifacts={}", config.gate_dir().display()));

    let report = evaluate(&config, &exporter)?;
    report_outcome(&ui, &config, &report);

    if integration.should_emit_json() {
        println!(
            "{}",
            serde_json::json!({
                "command": "gate",
                "status": report.verdict.label(),
                "reason": report.verdict.reason(),
                "committed_schema": config.committed_schema.display().to_string(),
                "diff": report.diff.as_ref().map(|_| report.artifacts.diff.display().to_string()),
                "added": report.diff.as_ref().map(DiffResult::added),
                "removed": report.diff.as_ref().map(DiffResult::removed),
                "meta": report.artifacts.meta.display().to_string(),
                "integration": integration,
            })
        );
    }

    match report.to_error() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Export the runtime schema and write its canonical form over the baseline.
pub fn run_refresh_baseline(args: RefreshBaselineArgs) -> Result<()> {
    let integration = OutputIntegration::detect();
    let ui = output_for(&integration);

    let config = gate_config(&args.config, args.committed_path)?;
    let artifacts = GateArtifacts::in_dir(config.gate_dir());
    ensure_dir(&artifacts.dir)?;
    artifacts.clear_previous_run()?;

    let exporter = CommandExporter {
        spec: config.exporter.clone(),
        log_path: artifacts.export_log.clone(),
    };

    ui.rule(Some("contract_gate refresh-baseline"));
    exporter
        .export(&artifacts.runtime_schema)
        .and_then(|()| verify_export_output(&exporter, &artifacts.runtime_schema))
        .map_err(|failure| GateError::ExportFailed {
            command: failure.command,
            exit_code: failure.exit_code,
            detail: failure.detail,
        })?;

    let normalized = normalize_to(&artifacts.runtime_schema, &config.committed_schema)?;
    ui.success(&format!(
        "baseline written: {}",
        config.committed_schema.display()
    ));
    ui.info("review and commit the baseline to accept the API change");

    if integration.should_emit_json() {
        println!(
            "{}",
            serde_json::json!({
                "command": "refresh-baseline",
                "status": "ok",
                "committed_schema": config.committed_schema.display().to_string(),
                "sha256": normalized.digest(),
                "integration": integration,
            })
        );
    }
    Ok(())
}
