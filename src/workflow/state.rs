//! Orchestration state model
//!
//! Tracks gate evidence across sessions, allowing:
//! - Resume from the phase the project is positioned at
//! - Inspect every gate attempt ever made
//! - Answer "did phase N really pass?" from the record alone

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::{Error, Result};

/// Version string written into every persisted document
pub const ORCHESTRATION_VERSION: &str = "1.0";

/// Exit code recorded when a gate exceeded the configured timeout
pub const EXIT_CODE_TIMEOUT: i32 = -1;

/// Exit code recorded when the gate could not be started or observed
pub const EXIT_CODE_RUNNER_ERROR: i32 = -2;

/// Maximum number of characters kept in `output_summary`
pub const OUTPUT_SUMMARY_CHARS: usize = 500;

/// One execution of one phase's gate.
///
/// Immutable once recorded: corrections are new entries, never edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    /// Phase this gate belongs to (1-based)
    pub phase: u32,
    /// Whether the gate passed
    pub passed: bool,
    /// When the gate was executed
    pub timestamp: DateTime<Utc>,
    /// Process exit code, or one of the reserved sentinels
    pub exit_code: i32,
    /// Wall-clock duration of the execution
    pub duration_seconds: f64,
    /// First characters of the combined stdout+stderr
    pub output_summary: String,
    /// Path (relative to the project root) of the full captured output
    #[serde(
        rename = "full_output_file",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub full_output_ref: Option<PathBuf>,
}

impl GateResult {
    /// Build a result, rejecting a pass with a non-zero exit code
    pub fn new(
        phase: u32,
        passed: bool,
        exit_code: i32,
        duration_seconds: f64,
        output: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        if passed && exit_code != 0 {
            return Err(Error::InvalidResult(format!(
                "phase {} marked passed with exit code {}",
                phase, exit_code
            )));
        }
        if phase == 0 {
            return Err(Error::InvalidResult("phase numbers start at 1".to_string()));
        }

        Ok(Self {
            phase,
            passed,
            timestamp,
            exit_code,
            duration_seconds: round_millis(duration_seconds.max(0.0)),
            output_summary: summarize_output(output),
            full_output_ref: None,
        })
    }

    /// Whether this result came from the timeout branch
    pub fn timed_out(&self) -> bool {
        self.exit_code == EXIT_CODE_TIMEOUT
    }

    /// Whether this result came from the runner failing to run the gate
    pub fn runner_error(&self) -> bool {
        self.exit_code == EXIT_CODE_RUNNER_ERROR
    }

    /// Status this result implies for its phase
    pub fn status(&self) -> PhaseStatus {
        if self.passed {
            PhaseStatus::Passed
        } else {
            PhaseStatus::Failed
        }
    }
}

/// Status of a phase as derived from the persisted record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatus {
    /// No gate result recorded
    NotRun,
    /// Latest gate result failed
    Failed,
    /// Latest gate result passed
    Passed,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseStatus::NotRun => "NOT_RUN",
            PhaseStatus::Failed => "FAILED",
            PhaseStatus::Passed => "PASSED",
        };
        f.write_str(s)
    }
}

/// The whole durable record for one project root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationState {
    /// Workspace this state belongs to
    pub project_root: PathBuf,
    /// Phase the workflow is positioned at (starts at 1)
    pub current_phase: u32,
    /// Latest result per phase
    #[serde(rename = "phase_gates", default)]
    pub phase_index: BTreeMap<u32, GateResult>,
    /// Every result ever recorded, oldest first
    #[serde(rename = "gate_history", default)]
    pub history: Vec<GateResult>,
    /// When orchestration started
    pub started_at: DateTime<Utc>,
    /// When the document was last saved
    pub last_updated: DateTime<Utc>,
    /// Persisted format version
    #[serde(rename = "orchestration_version")]
    pub schema_version: String,
}

impl OrchestrationState {
    /// Create a fresh state for a project root
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            project_root: project_root.into(),
            current_phase: 1,
            phase_index: BTreeMap::new(),
            history: Vec::new(),
            started_at: now,
            last_updated: now,
            schema_version: ORCHESTRATION_VERSION.to_string(),
        }
    }

    /// Append a result and move the workflow forward if it earns it.
    ///
    /// This is the only place `current_phase` changes.
    pub(crate) fn apply(&mut self, result: GateResult) {
        if result.passed && result.phase >= self.current_phase {
            self.current_phase = result.phase + 1;
        }
        self.phase_index.insert(result.phase, result.clone());
        self.history.push(result);
    }

    /// Latest result for a phase
    pub fn latest(&self, phase: u32) -> Option<&GateResult> {
        self.phase_index.get(&phase)
    }

    /// Status of a phase from its latest result
    pub fn phase_status(&self, phase: u32) -> PhaseStatus {
        self.latest(phase)
            .map(GateResult::status)
            .unwrap_or(PhaseStatus::NotRun)
    }

    /// All attempts for a phase, oldest first
    pub fn attempts(&self, phase: u32) -> impl Iterator<Item = &GateResult> {
        self.history.iter().filter(move |r| r.phase == phase)
    }

    /// Check the index/history relationship holds.
    ///
    /// Every indexed result must be the last history entry for its phase.
    pub fn is_consistent(&self) -> bool {
        self.phase_index
            .iter()
            .all(|(phase, indexed)| {
                indexed.phase == *phase && self.attempts(*phase).last() == Some(indexed)
            })
    }
}

/// Truncate combined output to the summary length, on a char boundary
pub fn summarize_output(output: &str) -> String {
    output.chars().take(OUTPUT_SUMMARY_CHARS).collect()
}

fn round_millis(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}
