//! Phase transition enforcement
//!
//! The controller is the only way to move through phases:
//! - `can_advance_to` answers from the persisted record, never from callers
//! - `run_phase` executes a gate only when its predecessor's latest gate passed
//! - `verify_all_blocking_phases_passed` re-derives completion on every call

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use super::phases::PhaseTable;
use super::runner::GateRunner;
use super::state::{GateResult, OrchestrationState, PhaseStatus};
use super::store::StateStore;
use crate::{Config, Result};

/// Whether a phase may be entered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Allowed,
    Blocked(BlockReason),
}

impl Transition {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Transition::Allowed)
    }
}

/// Why a transition is blocked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// The previous phase has no recorded gate result: do it first
    PreviousNotRun { phase: u32, name: String },
    /// The previous phase's latest gate failed: fix it and retry
    PreviousFailed {
        phase: u32,
        name: String,
        exit_code: i32,
        timed_out: bool,
    },
}

impl BlockReason {
    /// Phase that has to be dealt with first
    pub fn phase(&self) -> u32 {
        match self {
            BlockReason::PreviousNotRun { phase, .. } | BlockReason::PreviousFailed { phase, .. } => {
                *phase
            }
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::PreviousNotRun { phase, name } => write!(
                f,
                "previous phase gate has not been run: phase {} ({}) has no recorded gate result; run phase {} first",
                phase, name, phase
            ),
            BlockReason::PreviousFailed {
                phase,
                name,
                exit_code,
                timed_out,
            } => {
                let cause = if *timed_out {
                    "timed out".to_string()
                } else {
                    format!("exit code {}", exit_code)
                };
                write!(
                    f,
                    "previous phase gate failed: phase {} ({}) latest gate {}; fix it and re-run phase {}",
                    phase, name, cause, phase
                )
            }
        }
    }
}

/// Result of asking to run a phase
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    /// Not attempted; nothing was recorded
    Blocked(BlockReason),
    /// The gate ran (or passed through) and was recorded
    Ran(GateResult),
}

impl PhaseOutcome {
    /// True only when a gate ran and passed
    pub fn passed(&self) -> bool {
        matches!(self, PhaseOutcome::Ran(result) if result.passed)
    }
}

/// Status of one blocking phase
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockingPhase {
    pub phase: u32,
    pub name: String,
    pub status: PhaseStatus,
    pub last_run: Option<DateTime<Utc>>,
}

/// Completion verdict across all blocking phases
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockingVerification {
    pub phases: Vec<BlockingPhase>,
}

impl BlockingVerification {
    /// True only if every blocking phase's latest result passed
    pub fn all_passed(&self) -> bool {
        self.phases.iter().all(|p| p.status == PhaseStatus::Passed)
    }

    /// Blocking phases that still need work
    pub fn outstanding(&self) -> impl Iterator<Item = &BlockingPhase> {
        self.phases.iter().filter(|p| p.status != PhaseStatus::Passed)
    }
}

/// Enforces gate-backed phase progression
pub struct PhaseController {
    phases: PhaseTable,
    store: Arc<dyn StateStore>,
    runner: GateRunner,
}

impl PhaseController {
    /// Create a controller over an existing store and runner
    pub fn new(phases: PhaseTable, store: Arc<dyn StateStore>, runner: GateRunner) -> Self {
        Self {
            phases,
            store,
            runner,
        }
    }

    /// Create a controller from configuration
    pub fn from_config(config: &Config, store: Arc<dyn StateStore>) -> Result<Self> {
        let phases = config.phase_table()?;
        let runner = GateRunner::from_config(store.clone(), config);
        Ok(Self::new(phases, store, runner))
    }

    /// Phase table in use
    pub fn phases(&self) -> &PhaseTable {
        &self.phases
    }

    /// Decide whether `target` may be entered, from persisted state only
    pub fn can_advance_to(&self, target: u32) -> Result<Transition> {
        self.phases.get(target)?;
        Ok(self.transition_in(&self.store.load(), target))
    }

    fn transition_in(&self, state: &OrchestrationState, target: u32) -> Transition {
        if target == 1 {
            return Transition::Allowed;
        }

        let previous = target - 1;
        let name = self.phases.name(previous);
        match state.latest(previous) {
            None => Transition::Blocked(BlockReason::PreviousNotRun {
                phase: previous,
                name,
            }),
            Some(result) if !result.passed => Transition::Blocked(BlockReason::PreviousFailed {
                phase: previous,
                name,
                exit_code: result.exit_code,
                timed_out: result.timed_out(),
            }),
            Some(_) => Transition::Allowed,
        }
    }

    /// Run `target`'s gate if its predecessor passed.
    ///
    /// A blocked attempt records nothing. Re-running a passed phase appends
    /// a new result without moving `current_phase` back.
    pub async fn run_phase(&self, target: u32) -> Result<PhaseOutcome> {
        let gate = self.phases.gate_path(self.store.project_root(), target)?;

        if let Transition::Blocked(reason) = self.can_advance_to(target)? {
            info!("Phase {} blocked: {}", target, reason);
            return Ok(PhaseOutcome::Blocked(reason));
        }

        info!("Phase {} ({}) allowed, running gate", target, self.phases.name(target));
        let result = self.runner.run(target, gate.as_deref()).await?;
        Ok(PhaseOutcome::Ran(result))
    }

    /// Per-phase NOT_RUN / FAILED / PASSED for every blocking phase
    pub fn verify_all_blocking_phases_passed(&self) -> BlockingVerification {
        let state = self.store.load();
        let phases = self
            .phases
            .blocking()
            .map(|phase| BlockingPhase {
                phase: phase.number,
                name: phase.name.clone(),
                status: state.phase_status(phase.number),
                last_run: state.latest(phase.number).map(|r| r.timestamp),
            })
            .collect();

        BlockingVerification { phases }
    }
}
