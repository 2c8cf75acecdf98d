//! Line-oriented diff between two normalized documents.
//!
//! Lines are compared with their terminators, so the result is empty exactly
//! when the two texts are byte-identical. The edit script comes from Myers'
//! O((N+M)D) algorithm over the region left after trimming the common prefix
//! and suffix; if that region needs more than [`MAX_EDIT_DISTANCE`] edits it is
//! reported as a wholesale replacement instead.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::PathBuf;

use clap::Args;
use serde::Serialize;
use serde_json::json;

use crate::error::{GateError, Result};
use crate::normalize::{NormalizedSchemaDocument, normalize};
use crate::util::{OutputIntegration, ensure_exists, output_for, write_string};

#[derive(Debug, Clone, Args)]
pub struct DiffArgs {
    /// Baseline document.
    pub old: PathBuf,

    /// Document compared against the baseline.
    pub new: PathBuf,

    /// Write the unified diff here instead of stdout.
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

/// Unchanged lines shown around each change.
pub const CONTEXT_LINES: usize = 3;

/// Upper bound on the edit distance searched in the untrimmed middle region.
pub const MAX_EDIT_DISTANCE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Context,
    Added,
    Removed,
}

impl ChangeKind {
    #[must_use]
    pub fn prefix(self) -> char {
        match self {
            Self::Context => ' ',
            Self::Added => '+',
            Self::Removed => '-',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffLine {
    pub kind: ChangeKind,
    /// Line text including its newline, when the source had one.
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<DiffLine>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffResult {
    pub hunks: Vec<Hunk>,
}

impl DiffResult {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    /// Every record in order, hunk by hunk.
    pub fn records(&self) -> impl Iterator<Item = &DiffLine> {
        self.hunks.iter().flat_map(|hunk| hunk.lines.iter())
    }

    #[must_use]
    pub fn added(&self) -> usize {
        self.count(ChangeKind::Added)
    }

    #[must_use]
    pub fn removed(&self) -> usize {
        self.count(ChangeKind::Removed)
    }

    fn count(&self, kind: ChangeKind) -> usize {
        self.records().filter(|line| line.kind == kind).count()
    }

    /// Unified diff text; empty when there are no changes.
    #[must_use]
    pub fn render(&self, old_label: &str, new_label: &str) -> String {
        if self.is_empty() {
            return String::new();
        }

        let mut out = String::new();
        let _ = writeln!(out, "--- {old_label}");
        let _ = writeln!(out, "+++ {new_label}");
        for hunk in &self.hunks {
            let _ = writeln!(
                out,
                "@@ -{} +{} @@",
                format_range(hunk.old_start, hunk.old_len),
                format_range(hunk.new_start, hunk.new_len)
            );
            for line in &hunk.lines {
                out.push(line.kind.prefix());
                out.push_str(&line.text);
                if !line.text.ends_with('\n') {
                    out.push_str("\n\\ No newline at end of file\n");
                }
            }
        }
        out
    }
}

fn format_range(start: usize, len: usize) -> String {
    if len == 1 {
        start.to_string()
    } else {
        format!("{start},{len}")
    }
}

#[must_use]
pub fn diff(a: &NormalizedSchemaDocument, b: &NormalizedSchemaDocument) -> DiffResult {
    diff_text(a.as_str(), b.as_str())
}

#[must_use]
pub fn diff_text(a: &str, b: &str) -> DiffResult {
    if a == b {
        return DiffResult::default();
    }

    let old = a.split_inclusive('\n').collect::<Vec<_>>();
    let new = b.split_inclusive('\n').collect::<Vec<_>>();
    let edits = edit_script(&old, &new);
    DiffResult {
        hunks: group_hunks(&edits, &old, &new),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Equal { old: usize, new: usize },
    Delete { old: usize },
    Insert { new: usize },
}

fn edit_script(old: &[&str], new: &[&str]) -> Vec<Edit> {
    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(left, right)| left == right)
        .count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(left, right)| left == right)
        .count();

    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];

    let mut edits = (0..prefix)
        .map(|index| Edit::Equal {
            old: index,
            new: index,
        })
        .collect::<Vec<_>>();

    match myers(old_mid, new_mid, MAX_EDIT_DISTANCE) {
        Some(middle) => edits.extend(middle.into_iter().map(|edit| shift(edit, prefix))),
        None => {
            edits.extend((0..old_mid.len()).map(|index| Edit::Delete {
                old: prefix + index,
            }));
            edits.extend((0..new_mid.len()).map(|index| Edit::Insert {
                new: prefix + index,
            }));
        }
    }

    let old_tail = old.len() - suffix;
    let new_tail = new.len() - suffix;
    edits.extend((0..suffix).map(|index| Edit::Equal {
        old: old_tail + index,
        new: new_tail + index,
    }));
    edits
}

fn shift(edit: Edit, by: usize) -> Edit {
    match edit {
        Edit::Equal { old, new } => Edit::Equal {
            old: old + by,
            new: new + by,
        },
        Edit::Delete { old } => Edit::Delete { old: old + by },
        Edit::Insert { new } => Edit::Insert { new: new + by },
    }
}

/// Shortest edit script, or `None` when it needs more than `limit` edits.
///
/// `rounds[d]` holds the furthest x reached on each diagonal `k` in `-d..=d`
/// (step 2) after round `d`, stored at index `(k + d) / 2`.
fn myers(old: &[&str], new: &[&str], limit: usize) -> Option<Vec<Edit>> {
    let n = old.len() as isize;
    let m = new.len() as isize;
    let max = (old.len() + new.len()).min(limit) as isize;

    let furthest = |round: &[isize], d: isize, k: isize| round[((k + d) / 2) as usize];

    let mut rounds: Vec<Vec<isize>> = Vec::new();
    for d in 0..=max {
        let mut round = Vec::with_capacity(d as usize + 1);
        let mut k = -d;
        while k <= d {
            let mut x = if d == 0 {
                0
            } else {
                let previous: &[isize] = &rounds[(d - 1) as usize];
                let down = k == -d
                    || (k != d
                        && furthest(previous, d - 1, k - 1) < furthest(previous, d - 1, k + 1));
                if down {
                    furthest(previous, d - 1, k + 1)
                } else {
                    furthest(previous, d - 1, k - 1) + 1
                }
            };
            let mut y = x - k;
            while x < n && y < m && old[x as usize] == new[y as usize] {
                x += 1;
                y += 1;
            }
            round.push(x);
            if x >= n && y >= m {
                rounds.push(round);
                return Some(backtrack(&rounds, n, m));
            }
            k += 2;
        }
        rounds.push(round);
    }
    None
}

fn backtrack(rounds: &[Vec<isize>], n: isize, m: isize) -> Vec<Edit> {
    let furthest = |d: isize, k: isize| rounds[d as usize][((k + d) / 2) as usize];

    let mut edits = Vec::new();
    let mut x = n;
    let mut y = m;
    for d in (0..rounds.len() as isize).rev() {
        let k = x - y;
        let (prev_x, prev_y) = if d == 0 {
            (0, 0)
        } else {
            let down = k == -d || (k != d && furthest(d - 1, k - 1) < furthest(d - 1, k + 1));
            let prev_k = if down { k + 1 } else { k - 1 };
            let prev_x = furthest(d - 1, prev_k);
            (prev_x, prev_x - prev_k)
        };

        while x > prev_x && y > prev_y {
            x -= 1;
            y -= 1;
            edits.push(Edit::Equal {
                old: x as usize,
                new: y as usize,
            });
        }
        if d > 0 {
            if x == prev_x {
                edits.push(Edit::Insert {
                    new: prev_y as usize,
                });
            } else {
                edits.push(Edit::Delete {
                    old: prev_x as usize,
                });
            }
        }
        x = prev_x;
        y = prev_y;
    }
    edits.reverse();
    edits
}

fn group_hunks(edits: &[Edit], old: &[&str], new: &[&str]) -> Vec<Hunk> {
    let changes = edits
        .iter()
        .enumerate()
        .filter(|(_, edit)| !matches!(edit, Edit::Equal { .. }))
        .map(|(index, _)| index)
        .collect::<Vec<_>>();
    let Some(&first) = changes.first() else {
        return Vec::new();
    };

    let mut ranges = Vec::new();
    let (mut start, mut end) = (first, first);
    for &index in &changes[1..] {
        if index - end - 1 > 2 * CONTEXT_LINES {
            ranges.push((start, end));
            start = index;
        }
        end = index;
    }
    ranges.push((start, end));

    // Lines of each side consumed before edit i.
    let mut old_before = Vec::with_capacity(edits.len());
    let mut new_before = Vec::with_capacity(edits.len());
    let (mut old_seen, mut new_seen) = (0_usize, 0_usize);
    for edit in edits {
        old_before.push(old_seen);
        new_before.push(new_seen);
        match edit {
            Edit::Equal { .. } => {
                old_seen += 1;
                new_seen += 1;
            }
            Edit::Delete { .. } => old_seen += 1,
            Edit::Insert { .. } => new_seen += 1,
        }
    }

    ranges
        .into_iter()
        .map(|(first_change, last_change)| {
            let lo = first_change.saturating_sub(CONTEXT_LINES);
            let hi = (last_change + CONTEXT_LINES).min(edits.len() - 1);

            let mut lines = Vec::with_capacity(hi - lo + 1);
            let (mut old_len, mut new_len) = (0, 0);
            for edit in &edits[lo..=hi] {
                let (kind, text) = match *edit {
                    Edit::Equal { old: index, .. } => {
                        old_len += 1;
                        new_len += 1;
                        (ChangeKind::Context, old[index])
                    }
                    Edit::Delete { old: index } => {
                        old_len += 1;
                        (ChangeKind::Removed, old[index])
                    }
                    Edit::Insert { new: index } => {
                        new_len += 1;
                        (ChangeKind::Added, new[index])
                    }
                };
                lines.push(DiffLine {
                    kind,
                    text: text.to_string(),
                });
            }

            Hunk {
                old_start: hunk_start(old_before[lo], old_len),
                old_len,
                new_start: hunk_start(new_before[lo], new_len),
                new_len,
                lines,
            }
        })
        .collect()
}

fn hunk_start(consumed: usize, len: usize) -> usize {
    if len == 0 { consumed } else { consumed + 1 }
}

/// Normalize both documents and report their line diff; exits 1 when they differ.
pub fn run_diff(args: DiffArgs) -> Result<()> {
    let integration = OutputIntegration::detect();
    let ui = output_for(&integration);

    ensure_exists(&args.old)?;
    ensure_exists(&args.new)?;
    let result = diff(&normalize(&args.old)?, &normalize(&args.new)?);
    let rendered = result.render(
        &args.old.display().to_string(),
        &args.new.display().to_string(),
    );

    match &args.output {
        Some(path) => write_string(path, &rendered)?,
        None if !integration.should_emit_json() => {
            std::io::stdout().write_all(rendered.as_bytes())?;
        }
        None => {}
    }

    if integration.should_emit_json() {
        println!(
            "{}",
            json!({
                "command": "diff",
                "status": if result.is_empty() { "identical" } else { "different" },
                "old": args.old.display().to_string(),
                "new": args.new.display().to_string(),
                "added": result.added(),
                "removed": result.removed(),
                "hunks": result.hunks,
                "integration": integration,
            })
        );
    }

    if result.is_empty() {
        ui.success("documents are identical after normalization");
        Ok(())
    } else {
        Err(GateError::exit(
            1,
            format!(
                "documents differ after normalization (+{} -{})",
                result.added(),
                result.removed()
            ),
        ))
    }
}
