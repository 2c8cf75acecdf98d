use clap::{Parser, Subcommand};

use crate::diff::{DiffArgs, run_diff};
use crate::doctor::{DoctorArgs, run_doctor};
use crate::error::Result;
use crate::extract::{ListMarkersArgs, run_list_markers};
use crate::gate::{GateArgs, RefreshBaselineArgs, run_gate, run_refresh_baseline};
use crate::normalize::{NormalizeArgs, run_normalize};
use crate::stage::{StageArgs, run_stage};

#[derive(Debug, Parser)]
#[command(
    name = "contract_gate",
    about = "CI contract gate: API schema drift detection and test stage artifact capture",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Compare the runtime schema against the committed baseline.
    Gate(GateArgs),

    /// Run one test stage and capture its artifacts.
    Stage(StageArgs),

    /// Print or write the canonical form of a JSON document.
    Normalize(NormalizeArgs),

    /// Diff two JSON documents after normalization.
    Diff(DiffArgs),

    /// Export the runtime schema and overwrite the committed baseline.
    #[command(name = "refresh-baseline")]
    RefreshBaseline(RefreshBaselineArgs),

    /// Validate environment and configuration.
    Doctor(DoctorArgs),

    /// Print configured failure marker categories.
    #[command(name = "list-markers")]
    ListMarkers(ListMarkersArgs),
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    run(cli)
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Gate(args) => run_gate(args),
        Commands::Stage(args) => run_stage(args),
        Commands::Normalize(args) => run_normalize(args),
        Commands::Diff(args) => run_diff(args),
        Commands::RefreshBaseline(args) => run_refresh_baseline(args),
        Commands::Doctor(args) => run_doctor(args),
        Commands::ListMarkers(args) => run_list_markers(args),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use crate::config::ConfigArgs;
    use crate::error::GateError;
    use crate::extract::ListMarkersArgs;
    use crate::normalize::NormalizeArgs;
    use crate::stage::StageArgs;

    use super::{Cli, Commands, run};

    #[test]
    fn list_markers_command_dispatches_successfully() {
        let result = run(Cli {
            command: Commands::ListMarkers(ListMarkersArgs {
                config: ConfigArgs::default(),
            }),
        });
        assert!(result.is_ok());
    }

    #[test]
    fn stage_command_dispatches_invalid_stage_error() {
        let result = run(Cli {
            command: Commands::Stage(StageArgs {
                stage: "a/b".to_string(),
                target: "tests".to_string(),
                config: ConfigArgs::default(),
            }),
        });

        match result.expect_err("nested stage name should fail") {
            GateError::InvalidArgument { message } => assert!(message.contains("a/b")),
            other => panic!("expected InvalidArgument, got {other}"),
        }
    }

    #[test]
    fn normalize_command_dispatches_missing_path_error() {
        let result = run(Cli {
            command: Commands::Normalize(NormalizeArgs {
                source: PathBuf::from("/tmp/contract_gate/does-not-exist.json"),
                output: None,
            }),
        });

        match result.expect_err("missing source should fail") {
            GateError::MissingPath { path } => {
                assert_eq!(path, PathBuf::from("/tmp/contract_gate/does-not-exist.json"));
            }
            other => panic!("expected MissingPath, got {other}"),
        }
    }

    #[test]
    fn parser_accepts_shared_config_flags_on_subcommands() {
        let cli = Cli::try_parse_from([
            "contract_gate",
            "gate",
            "schema/openapi.json",
            "--artifact-root",
            "/tmp/out",
            "--config",
            "ci/gate.env",
        ])
        .expect("parse gate args");

        match cli.command {
            Commands::Gate(args) => {
                assert_eq!(args.committed_path, Some(PathBuf::from("schema/openapi.json")));
                assert_eq!(args.config.artifact_root, Some(PathBuf::from("/tmp/out")));
                assert_eq!(args.config.config, Some(PathBuf::from("ci/gate.env")));
            }
            other => panic!("expected gate command, got {other:?}"),
        }
    }

    #[test]
    fn parser_requires_stage_and_target() {
        assert!(Cli::try_parse_from(["contract_gate", "stage", "unit"]).is_err());
        assert!(Cli::try_parse_from(["contract_gate", "stage", "unit", "tests/unit"]).is_ok());
    }
}
