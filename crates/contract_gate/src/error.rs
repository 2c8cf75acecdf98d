use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GateError>;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing dependency command: {command}")]
    MissingCommand { command: String },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("invalid marker pattern for category {category}: {message}")]
    InvalidMarker { category: String, message: String },

    #[error("required path does not exist: {path}")]
    MissingPath { path: PathBuf },

    #[error(
        "missing baseline: committed schema not found at {path}; commit a baseline (run `contract_gate refresh-baseline`) and retry"
    )]
    MissingBaseline { path: PathBuf },

    #[error("schema export failed: {command} (exit={exit_code}): {detail}")]
    ExportFailed {
        command: String,
        exit_code: i32,
        detail: String,
    },

    #[error("schema document is not valid JSON: {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "schema drift detected (+{added} -{removed}); see {diff_path}. Regenerate and commit the schema, or revert the API change"
    )]
    SchemaDrift {
        diff_path: PathBuf,
        added: usize,
        removed: usize,
    },

    #[error("test stage failed: {stage} (exit={exit_code})")]
    StageFailed { stage: String, exit_code: i32 },

    #[error("{message}")]
    Exit { code: i32, message: String },
}

impl GateError {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exit { code, .. } => *code,
            Self::StageFailed { exit_code, .. } => *exit_code,
            _ => 1,
        }
    }

    #[must_use]
    pub fn exit(code: i32, message: impl Into<String>) -> Self {
        Self::Exit {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Short machine label used in metadata and JSON output.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::MissingCommand { .. } => "missing_command",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::InvalidMarker { .. } => "invalid_marker",
            Self::MissingPath { .. } => "missing_path",
            Self::MissingBaseline { .. } => "missing_baseline",
            Self::ExportFailed { .. } => "export_failure",
            Self::Parse { .. } => "parse_error",
            Self::SchemaDrift { .. } => "content_drift",
            Self::StageFailed { .. } => "stage_failure",
            Self::Exit { .. } => "exit",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::GateError;

    #[test]
    fn exit_constructor_preserves_code_and_message() {
        let error = GateError::exit(42, "boom");
        assert_eq!(error.exit_code(), 42);
        assert_eq!(error.to_string(), "boom");
    }

    #[test]
    fn stage_failure_exit_code_is_propagated() {
        let error = GateError::StageFailed {
            stage: "unit".to_string(),
            exit_code: 17,
        };
        assert_eq!(error.exit_code(), 17);
        assert_eq!(error.kind(), "stage_failure");
    }

    #[test]
    fn gate_conditions_exit_with_one() {
        let baseline = GateError::MissingBaseline {
            path: PathBuf::from("openapi/openapi.json"),
        };
        assert_eq!(baseline.exit_code(), 1);
        assert!(baseline.to_string().contains("commit a baseline"));

        let export = GateError::ExportFailed {
            command: "python export.py".to_string(),
            exit_code: 3,
            detail: "exporter exited with a failure status".to_string(),
        };
        assert_eq!(export.exit_code(), 1);
        assert!(export.to_string().contains("exit=3"));

        let drift = GateError::SchemaDrift {
            diff_path: PathBuf::from("artifacts/contract/schema.diff"),
            added: 2,
            removed: 0,
        };
        assert_eq!(drift.exit_code(), 1);
        assert!(drift.to_string().contains("+2 -0"));
        assert!(drift.to_string().contains("schema.diff"));
    }

    #[test]
    fn parse_error_names_the_offending_path() {
        let source = serde_json::from_str::<serde_json::Value>("{").expect_err("truncated json");
        let error = GateError::Parse {
            path: PathBuf::from("/tmp/broken.json"),
            source,
        };
        assert_eq!(error.exit_code(), 1);
        assert!(error.to_string().contains("/tmp/broken.json"));
        assert_eq!(error.kind(), "parse_error");
    }
}
