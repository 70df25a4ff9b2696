//! Phase-gated state machine
//!
//! Provides the enforcement core for a linear, gate-backed delivery workflow:
//!
//! - **Phases**: a fixed, ordered table (`1..=N`), some of them blocking
//! - **Gates**: external executables; exit `0` passes, anything else fails
//! - **Evidence**: every gate execution is recorded, including timeouts
//! - **State**: one JSON document per project, saved after every mutation
//!
//! ## Example Configuration
//!
//! ```toml
//! gate_timeout = "10m"
//!
//! [[phases]]
//! number = 1
//! name = "Planning"
//!
//! [[phases]]
//! number = 2
//! name = "Integration Testing"
//! gate = "scripts/gates/phase2_gate.sh"
//! blocking = true
//! ```
//!
//! ## Running Phases
//!
//! ```bash
//! # Is phase 2 reachable yet?
//! phasegate can-proceed 2
//!
//! # Run phase 2's gate (refused unless phase 1 passed)
//! phasegate run-phase 2
//!
//! # Completion check across blocking phases
//! phasegate verify-gates
//! ```

pub mod controller;
pub mod phases;
pub mod runner;
pub mod state;
pub mod store;

pub use controller::{
    BlockReason, BlockingPhase, BlockingVerification, PhaseController, PhaseOutcome, Transition,
};
pub use phases::{default_phases, PhaseConfig, PhaseTable};
pub use runner::GateRunner;
pub use state::{
    GateResult, OrchestrationState, PhaseStatus, EXIT_CODE_RUNNER_ERROR, EXIT_CODE_TIMEOUT,
    ORCHESTRATION_VERSION,
};
pub use store::{FileStateStore, GateRecord, MemoryStateStore, OutputRead, StateStore};
