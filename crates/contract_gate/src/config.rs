//! Env-style configuration for the gate and the stage runner.
//!
//! Values resolve in this order, later sources winning: the embedded
//! `config/defaults.env`, an optional override file (`--config` or
//! `CONTRACT_GATE_CONFIG`), `CONTRACT_GATE_ARTIFACT_ROOT`, then CLI flags.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::Args;

use crate::error::{GateError, Result};
use crate::extract::MarkerSet;
use crate::util::{parse_bool, validate_stage_name};

const DEFAULTS: &str = include_str!("../config/defaults.env");

pub const CONFIG_ENV: &str = "CONTRACT_GATE_CONFIG";
pub const ARTIFACT_ROOT_ENV: &str = "CONTRACT_GATE_ARTIFACT_ROOT";

const MARKER_PREFIX: &str = "marker.";

/// Options shared by every command that reads configuration.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// Override file in `key=value` form.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Root directory for per-stage artifacts.
    #[arg(long = "artifact-root")]
    pub artifact_root: Option<PathBuf>,
}

impl ConfigArgs {
    pub fn load(&self) -> Result<ConfigValues> {
        ConfigValues::load(self.config.as_deref())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigValues {
    pub values: BTreeMap<String, String>,
}

impl ConfigValues {
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            values: parse_config_content(DEFAULTS),
        }
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::builtin();

        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        if let Some(path) = path.map(Path::to_path_buf).or(env_path) {
            if !path.exists() {
                return Err(GateError::MissingPath { path });
            }
            let content = std::fs::read_to_string(&path)?;
            config.merge(parse_config_content(&content));
        }

        if let Some(root) = std::env::var_os(ARTIFACT_ROOT_ENV) {
            config.values.insert(
                "artifact_root".to_string(),
                root.to_string_lossy().into_owned(),
            );
        }

        Ok(config)
    }

    pub fn merge(&mut self, overrides: BTreeMap<String, String>) {
        self.values.extend(overrides);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| GateError::invalid(format!("missing configuration value: {key}")))
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        self.get(key)
            .map(|raw| {
                parse_bool(raw).ok_or_else(|| {
                    GateError::invalid(format!("invalid boolean for {key}: {raw}"))
                })
            })
            .transpose()
    }

    /// `(category, pattern)` pairs from `marker.<category>` keys, sorted by category.
    #[must_use]
    pub fn markers(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(MARKER_PREFIX)
                    .filter(|category| !category.is_empty())
                    .map(|category| (category.to_string(), value.clone()))
            })
            .filter(|(_, pattern)| !pattern.trim().is_empty())
            .collect()
    }
}

/// An external program plus its argument template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args_template: String,
}

impl CommandSpec {
    #[must_use]
    pub fn label(&self) -> String {
        if self.args_template.trim().is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args_template)
        }
    }
}

/// Everything the schema gate needs for one invocation.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub committed_schema: PathBuf,
    pub artifact_root: PathBuf,
    pub gate_stage: String,
    pub exporter: CommandSpec,
    pub evidence_ledger: bool,
}

impl GateConfig {
    pub fn resolve(
        values: &ConfigValues,
        committed_schema: Option<PathBuf>,
        artifact_root: Option<PathBuf>,
    ) -> Result<Self> {
        let gate_stage = values.require("gate_stage")?;
        validate_stage_name(gate_stage)?;
        Ok(Self {
            committed_schema: committed_schema
                .unwrap_or_else(|| PathBuf::from(values.get("committed_schema").unwrap_or_default())),
            artifact_root: artifact_root
                .unwrap_or_else(|| PathBuf::from(values.get("artifact_root").unwrap_or_default())),
            gate_stage: gate_stage.to_string(),
            exporter: CommandSpec {
                program: values.require("exporter_command")?.to_string(),
                args_template: values.get("exporter_args").unwrap_or_default().to_string(),
            },
            evidence_ledger: values.get_bool("evidence_ledger")?.unwrap_or(true),
        })
    }

    #[must_use]
    pub fn gate_dir(&self) -> PathBuf {
        self.artifact_root.join(&self.gate_stage)
    }
}

/// Everything the test stage runner needs for one invocation.
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub stage: String,
    pub target: String,
    pub artifact_root: PathBuf,
    pub runner: CommandSpec,
    pub markers: MarkerSet,
    pub evidence_ledger: bool,
}

impl StageConfig {
    pub fn resolve(
        values: &ConfigValues,
        stage: String,
        target: String,
        artifact_root: Option<PathBuf>,
    ) -> Result<Self> {
        Ok(Self {
            stage,
            target,
            artifact_root: artifact_root
                .unwrap_or_else(|| PathBuf::from(values.get("artifact_root").unwrap_or_default())),
            runner: CommandSpec {
                program: values.require("runner_command")?.to_string(),
                args_template: values.get("runner_args").unwrap_or_default().to_string(),
            },
            markers: MarkerSet::compile(&values.markers())?,
            evidence_ledger: values.get_bool("evidence_ledger")?.unwrap_or(true),
        })
    }

    #[must_use]
    pub fn stage_dir(&self) -> PathBuf {
        self.artifact_root.join(&self.stage)
    }
}

#[must_use]
pub fn parse_config_content(content: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();

    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };

        let key = key.trim().to_string();
        let mut value = value_raw.trim().to_string();

        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }

        values.insert(key, value);
    }

    values
}
