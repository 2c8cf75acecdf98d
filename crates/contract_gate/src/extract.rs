//! Failure triage over a captured test log.
//!
//! Lines are matched case-insensitively against named marker categories.
//! The excerpt keeps matching lines in log order, duplicates included. An
//! empty excerpt is a valid outcome.

use std::path::Path;

use clap::Args;
use regex_lite::Regex;
use serde::Serialize;
use serde_json::json;

use crate::config::ConfigArgs;
use crate::error::{GateError, Result};
use crate::util::{OutputIntegration, write_string};

#[derive(Debug, Clone, Args)]
pub struct ListMarkersArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

/// One named diagnostic category and its compiled pattern.
#[derive(Debug, Clone)]
pub struct Marker {
    pub category: String,
    pub pattern: String,
    regex: Regex,
}

impl Marker {
    pub fn new(category: &str, pattern: &str) -> Result<Self> {
        let regex = Regex::new(&format!("(?i){pattern}")).map_err(|error| {
            GateError::InvalidMarker {
                category: category.to_string(),
                message: error.to_string(),
            }
        })?;
        Ok(Self {
            category: category.to_string(),
            pattern: pattern.to_string(),
            regex,
        })
    }

    #[must_use]
    pub fn matches(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MarkerSet {
    markers: Vec<Marker>,
}

impl MarkerSet {
    /// Compile `(category, pattern)` pairs in the order given.
    pub fn compile(pairs: &[(String, String)]) -> Result<Self> {
        let markers = pairs
            .iter()
            .map(|(category, pattern)| Marker::new(category, pattern))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { markers })
    }

    #[must_use]
    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    #[must_use]
    pub fn categories(&self) -> Vec<&str> {
        self.markers
            .iter()
            .map(|marker| marker.category.as_str())
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    fn first_match(&self, line: &str) -> Option<&Marker> {
        self.markers.iter().find(|marker| marker.matches(line))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcerptLine {
    /// 1-based line number in the captured log.
    pub line_number: usize,
    pub category: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureExcerpt {
    pub lines: Vec<ExcerptLine>,
}

impl FailureExcerpt {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Matched lines only, newline-terminated, in log order.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&line.text);
            out.push('\n');
        }
        out
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        write_string(path, &self.to_text())
    }
}

#[must_use]
pub fn extract(log_text: &str, markers: &MarkerSet) -> FailureExcerpt {
    let lines = log_text
        .lines()
        .enumerate()
        .filter_map(|(index, text)| {
            markers.first_match(text).map(|marker| ExcerptLine {
                line_number: index + 1,
                category: marker.category.clone(),
                text: text.to_string(),
            })
        })
        .collect();
    FailureExcerpt { lines }
}

/// Extract from raw log bytes; invalid UTF-8 is replaced, never rejected.
#[must_use]
pub fn extract_bytes(log_bytes: &[u8], markers: &MarkerSet) -> FailureExcerpt {
    extract(&String::from_utf8_lossy(log_bytes), markers)
}

/// Print the configured marker categories and their patterns.
pub fn run_list_markers(args: ListMarkersArgs) -> Result<()> {
    let markers = MarkerSet::compile(&args.config.load()?.markers())?;

    if OutputIntegration::detect().should_emit_json() {
        let entries = markers
            .markers()
            .iter()
            .map(|marker| json!({"category": marker.category, "pattern": marker.pattern}))
            .collect::<Vec<_>>();
        println!("{}", json!({"command": "list-markers", "markers": entries}));
    } else {
        for marker in markers.markers() {
            println!("{}\t{}", marker.category, marker.pattern);
        }
    }
    Ok(())
}
