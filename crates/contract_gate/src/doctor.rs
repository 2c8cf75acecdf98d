use std::path::Path;

use clap::Args;
use serde_json::json;

use crate::config::{ConfigArgs, GateConfig, StageConfig};
use crate::error::{GateError, Result};
use crate::util::{CliOutput, OutputIntegration, command_exists, ensure_dir, output_for};

#[derive(Debug, Clone, Args)]
pub struct DoctorArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Treat a missing committed baseline as an error.
    #[arg(long = "require-baseline")]
    pub require_baseline: bool,
}

fn check_command(name: &str, role: &str, ui: &CliOutput) -> Result<()> {
    if command_exists(name) {
        ui.success(&format!("{role} command available: {name}"));
        Ok(())
    } else {
        ui.error(&format!("{role} command missing: {name}"));
        Err(GateError::MissingCommand {
            command: name.to_string(),
        })
    }
}

fn check_writable(dir: &Path, ui: &CliOutput) -> Result<()> {
    ensure_dir(dir)?;
    let probe = dir.join(".contract_gate_probe");
    std::fs::write(&probe, b"ok")?;
    std::fs::remove_file(&probe)?;
    ui.success(&format!("artifact root writable: {}", dir.display()));
    Ok(())
}

pub fn run_doctor(args: DoctorArgs) -> Result<()> {
    let integration = OutputIntegration::detect();
    let ui = output_for(&integration);

    ui.rule(Some("contract_gate doctor"));
    ui.info(&format!(
        "config={}",
        args.config
            .config
            .as_ref()
            .map_or_else(|| "builtin".to_string(), |path| path.display().to_string())
    ));

    ui.rule(Some("environment detection"));
    ui.info(&format!(
        "fastapi_output mode={} agent={} ci={} tty={}",
        integration.fastapi_mode,
        integration.fastapi_agent,
        integration.fastapi_ci,
        integration.fastapi_tty
    ));
    ui.info(&format!(
        "sqlmodel_console mode={} agent={}",
        integration.sqlmodel_mode, integration.sqlmodel_agent
    ));

    ui.rule(Some("configuration"));
    let values = args.config.load()?;
    let gate = GateConfig::resolve(&values, None, args.config.artifact_root.clone())?;
    let stage = StageConfig::resolve(
        &values,
        "doctor".to_string(),
        String::new(),
        args.config.artifact_root.clone(),
    )?;
    ui.success(&format!(
        "markers compiled: {}",
        stage.markers.categories().join(", ")
    ));
    if stage.markers.is_empty() {
        ui.warning("no failure markers configured; excerpts will always be empty");
    }

    ui.rule(Some("commands"));
    check_command(&gate.exporter.program, "exporter", &ui)?;
    check_command(&stage.runner.program, "runner", &ui)?;

    ui.rule(Some("paths"));
    let baseline_present = gate.committed_schema.is_file();
    if baseline_present {
        ui.success(&format!(
            "committed baseline: {}",
            gate.committed_schema.display()
        ));
    } else if args.require_baseline {
        ui.error(&format!(
            "committed baseline missing: {}",
            gate.committed_schema.display()
        ));
        return Err(GateError::MissingBaseline {
            path: gate.committed_schema,
        });
    } else {
        ui.warning(&format!(
            "committed baseline missing: {} (gate will block)",
            gate.committed_schema.display()
        ));
    }
    check_writable(&gate.artifact_root, &ui)?;

    ui.success("doctor completed successfully");

    if integration.should_emit_json() {
        println!(
            "{}",
            json!({
                "command": "doctor",
                "status": "ok",
                "committed_schema": gate.committed_schema.display().to_string(),
                "baseline_present": baseline_present,
                "artifact_root": gate.artifact_root.display().to_string(),
                "exporter": gate.exporter.label(),
                "runner": stage.runner.label(),
                "markers": stage.markers.categories(),
                "integration": integration,
            })
        );
    }
    Ok(())
}
