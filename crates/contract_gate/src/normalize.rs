//! Canonical form for schema documents.
//!
//! Mapping keys are sorted at every depth, sequences keep their source order,
//! and the text layout is fixed: two-space indentation, `": "` between key and
//! value, non-ASCII characters written verbatim, exactly one trailing newline.
//! Normalizing already-normalized text returns it unchanged. Numbers keep the
//! text they were written with, so floats never drift on a second pass and
//! integers wider than 64 bits stay distinct.

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::Args;
use serde_json::{Map, Value, json};

use crate::error::{GateError, Result};
use crate::util::{OutputIntegration, ensure_exists, output_for, sha256_hex, write_string};

#[derive(Debug, Clone, Args)]
pub struct NormalizeArgs {
    /// JSON document to normalize.
    pub source: PathBuf,

    /// Write here instead of stdout.
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

/// A JSON tree read from a file.
#[derive(Debug, Clone)]
pub struct SchemaDocument {
    pub path: PathBuf,
    pub tree: Value,
}

impl SchemaDocument {
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::parse(path, &bytes)
    }

    pub fn parse(path: &Path, bytes: &[u8]) -> Result<Self> {
        let tree = serde_json::from_slice::<Value>(bytes).map_err(|source| GateError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            tree,
        })
    }
}

/// Canonical text of a [`SchemaDocument`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSchemaDocument {
    text: String,
}

impl NormalizedSchemaDocument {
    #[must_use]
    pub fn from_tree(tree: &Value) -> Self {
        let canonical = canonicalize(tree);
        // Serializing a Value cannot fail: keys are always strings.
        let mut text = serde_json::to_string_pretty(&canonical).unwrap_or_default();
        text.push('\n');
        Self { text }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn digest(&self) -> String {
        sha256_hex(self.text.as_bytes())
    }

    pub fn write_to(&self, destination: &Path) -> Result<()> {
        write_string(destination, &self.text)
    }
}

/// Read `document_path` and return its canonical form.
pub fn normalize(document_path: &Path) -> Result<NormalizedSchemaDocument> {
    let document = SchemaDocument::read(document_path)?;
    Ok(NormalizedSchemaDocument::from_tree(&document.tree))
}

/// Normalize `document_path` and write the result to `destination`.
pub fn normalize_to(document_path: &Path, destination: &Path) -> Result<NormalizedSchemaDocument> {
    let normalized = normalize(document_path)?;
    normalized.write_to(destination)?;
    Ok(normalized)
}

/// Normalize in-memory JSON text. `origin` names the source in parse errors.
pub fn normalize_str(origin: &Path, text: &str) -> Result<NormalizedSchemaDocument> {
    let document = SchemaDocument::parse(origin, text.as_bytes())?;
    Ok(NormalizedSchemaDocument::from_tree(&document.tree))
}

pub fn run_normalize(args: NormalizeArgs) -> Result<()> {
    ensure_exists(&args.source)?;
    let normalized = normalize(&args.source)?;

    let Some(output) = &args.output else {
        std::io::stdout().write_all(normalized.as_str().as_bytes())?;
        return Ok(());
    };

    let integration = OutputIntegration::detect();
    let ui = output_for(&integration);
    normalized.write_to(output)?;
    ui.success(&format!(
        "normalized {} -> {}",
        args.source.display(),
        output.display()
    ));

    if integration.should_emit_json() {
        println!(
            "{}",
            json!({
                "command": "normalize",
                "status": "ok",
                "source": args.source.display().to_string(),
                "output": output.display().to_string(),
                "sha256": normalized.digest(),
                "integration": integration,
            })
        );
    }
    Ok(())
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|(left, _), (right, _)| left.cmp(right));
            let mut sorted = Map::new();
            for (key, child) in entries {
                sorted.insert(key.clone(), canonicalize(child));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        scalar => scalar.clone(),
    }
}
