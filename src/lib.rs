//! Phasegate: Phase-Gated Delivery Orchestration
//!
//! A small Rust binary that refuses to let a delivery workflow claim progress
//! it cannot prove. Every phase transition goes through an external gate
//! executable, and every gate execution is recorded:
//! - **Gates**: opaque executables, `0` means pass, anything else fails
//! - **Evidence**: append-only history plus a latest-result-per-phase index
//! - **Transitions**: phase N is reachable only when phase N-1's latest gate passed
//!
//! # Core Philosophy
//!
//! Don't trust claims, check the record.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        CLI / higher-level enforcer      │
//! │  $ phasegate run-phase 5                │
//! └────────────────────┬────────────────────┘
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │           PhaseController               │
//! │  can_advance_to → run gate → verdict    │
//! └────────────────────┬────────────────────┘
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │   GateRunner (subprocess + timeout)     │
//! │   StateStore (atomic JSON evidence)     │
//! └─────────────────────────────────────────┘
//! ```

pub mod config;
pub mod report;
pub mod workflow;

// Re-exports for convenience
pub use config::Config;
pub use workflow::{
    BlockReason, FileStateStore, GateResult, GateRunner, MemoryStateStore, OrchestrationState,
    PhaseController, PhaseOutcome, PhaseStatus, PhaseTable, StateStore, Transition,
};

/// Crate-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown phase {phase}: configured phases are 1..={total}")]
    UnknownPhase { phase: u32, total: u32 },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid gate result: {0}")]
    InvalidResult(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
