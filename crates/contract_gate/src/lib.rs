#![forbid(unsafe_code)]

//! CI contract gate.
//!
//! Blocks a merge when the API schema exported from the running application
//! differs from the committed baseline, and runs test stages so that their
//! reports, logs and failure excerpts always land in a predictable
//! per-stage artifact directory.

pub mod cli;
pub mod config;
pub mod diff;
pub mod doctor;
pub mod error;
pub mod extract;
pub mod gate;
pub mod normalize;
pub mod runmeta;
pub mod stage;
pub mod util;

pub use cli::{run, run_from_env};
pub use diff::{DiffResult, diff, diff_text};
pub use error::{GateError, Result};
pub use extract::{FailureExcerpt, MarkerSet, extract};
pub use gate::{GateReport, GateVerdict, SchemaExporter, evaluate};
pub use normalize::{NormalizedSchemaDocument, normalize};
pub use stage::{TestStageArtifact, run_test_stage};
