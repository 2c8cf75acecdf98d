use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::util::{append_line, now_utc_iso, remove_if_exists, write_string};

pub const POLICY_ID: &str = "contract_gate/v1";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GateMeta {
    pub verdict: String,
    pub reason: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub committed_schema: String,
    pub runtime_schema: String,
    pub exporter_command: String,
    pub exporter_exit_code: Option<i32>,
    pub committed_digest: Option<String>,
    pub runtime_digest: Option<String>,
    pub diff_path: Option<String>,
    pub added_lines: Option<usize>,
    pub removed_lines: Option<usize>,
    pub trace_id: String,
    pub evidence_ledger: Option<String>,
}

impl GateMeta {
    pub fn write_to_path(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        write_string(path, &content)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str::<Self>(&content)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StageMeta {
    pub stage: String,
    pub target: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub duration_seconds: Option<i64>,
    pub runner_command: Vec<String>,
    pub exit_code: Option<i32>,
    pub capture_error: Option<String>,
    pub log: String,
    pub junit: String,
    pub coverage: String,
    pub junit_exists: Option<bool>,
    pub coverage_exists: Option<bool>,
    pub failure_excerpt: Option<String>,
    pub failure_excerpt_lines: Option<usize>,
    pub trace_id: String,
    pub evidence_ledger: Option<String>,
}

impl StageMeta {
    pub fn write_to_path(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        write_string(path, &content)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str::<Self>(&content)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: String,
    pub trace_id: String,
    pub decision_id: String,
    pub action: String,
    pub evidence_terms: Vec<String>,
    pub policy_id: String,
}

impl DecisionRecord {
    pub fn append_jsonl(&self, path: &Path) -> Result<()> {
        let line = serde_json::to_string(self)?;
        append_line(path, &line)
    }
}

/// Per-invocation JSONL ledger. Starts empty; a disabled ledger records nothing.
#[derive(Debug, Clone)]
pub struct EvidenceLedger {
    path: Option<PathBuf>,
    trace_id: String,
    next_decision: usize,
}

impl EvidenceLedger {
    pub fn open(path: PathBuf, trace_id: String, enabled: bool) -> Result<Self> {
        remove_if_exists(&path)?;
        Ok(Self {
            path: enabled.then_some(path),
            trace_id,
            next_decision: 1,
        })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn record(&mut self, action: &str, evidence_terms: Vec<String>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let record = DecisionRecord {
            timestamp: now_utc_iso(),
            trace_id: self.trace_id.clone(),
            decision_id: format!("decision-{:04}", self.next_decision),
            action: action.to_string(),
            evidence_terms,
            policy_id: POLICY_ID.to_string(),
        };
        self.next_decision += 1;
        record.append_jsonl(path)
    }
}

#[must_use]
pub fn new_trace_id(prefix: &str) -> String {
    format!(
        "{prefix}-{}-{}",
        crate::util::now_compact_timestamp(),
        std::process::id()
    )
}
