//! Human-readable rendering of orchestration state for the CLI
//!
//! Everything here reads state; nothing writes it.

use crate::workflow::{
    BlockingVerification, GateResult, OrchestrationState, OutputRead, PhaseOutcome, PhaseStatus,
    PhaseTable, Transition,
};

fn icon(status: PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::NotRun => "⬜",
        PhaseStatus::Failed => "❌",
        PhaseStatus::Passed => "✅",
    }
}

fn result_line(result: &GateResult) -> String {
    let mut line = format!(
        "{} | phase {} | {} | exit {} | {:.3}s",
        result.timestamp.format("%Y-%m-%d %H:%M:%S"),
        result.phase,
        result.status(),
        result.exit_code,
        result.duration_seconds
    );
    if result.timed_out() {
        line.push_str(" | timed out");
    } else if result.runner_error() {
        line.push_str(" | runner error");
    }
    line
}

fn first_line(text: &str) -> &str {
    text.lines().find(|l| !l.trim().is_empty()).unwrap_or("")
}

/// Full status dump
pub fn status(state: &OrchestrationState, phases: &PhaseTable) -> String {
    let current = if state.current_phase > phases.total() {
        format!("{} (all phases complete)", state.current_phase)
    } else {
        format!("{} ({})", state.current_phase, phases.name(state.current_phase))
    };

    let mut lines = vec![
        format!("Project: {}", state.project_root.display()),
        format!("Current phase: {}", current),
        format!("Started: {}", state.started_at.to_rfc3339()),
        format!("Last updated: {}", state.last_updated.to_rfc3339()),
        format!("Gate executions: {}", state.history.len()),
        String::new(),
        "Phases:".to_string(),
    ];

    for phase in phases.iter() {
        let status = state.phase_status(phase.number);
        let blocking = if phase.blocking { " [blocking]" } else { "" };
        let gate = phase
            .gate
            .as_ref()
            .map(|g| g.display().to_string())
            .unwrap_or_else(|| "no gate".to_string());
        lines.push(format!(
            "  {} {}. {}{}: {} ({})",
            icon(status),
            phase.number,
            phase.name,
            blocking,
            status,
            gate
        ));

        if let Some(result) = state.latest(phase.number) {
            lines.push(format!("       last: {}", result_line(result)));
            let summary = first_line(&result.output_summary);
            if !summary.is_empty() {
                lines.push(format!("       {}", summary));
            }
        }
    }

    lines.join("\n")
}

/// Outcome of `run-phase`
pub fn outcome(target: u32, outcome: &PhaseOutcome, phases: &PhaseTable) -> String {
    match outcome {
        PhaseOutcome::Blocked(reason) => {
            format!("⛔ Phase {} blocked: {}", target, reason)
        }
        PhaseOutcome::Ran(result) if result.passed => format!(
            "✅ Phase {} ({}) gate PASSED in {:.3}s\n{}",
            target,
            phases.name(target),
            result.duration_seconds,
            result.output_summary.trim_end()
        ),
        PhaseOutcome::Ran(result) => {
            let cause = if result.timed_out() {
                "timed out".to_string()
            } else if result.runner_error() {
                "could not be run".to_string()
            } else {
                format!("exited with code {}", result.exit_code)
            };
            let mut text = format!(
                "❌ Phase {} ({}) gate FAILED: {}; fix the reported problems and re-run phase {}\n{}",
                target,
                phases.name(target),
                cause,
                target,
                result.output_summary.trim_end()
            );
            if let Some(path) = &result.full_output_ref {
                text.push_str(&format!("\nFull output: {}", path.display()));
            }
            text
        }
    }
}

/// Answer to `can-proceed`
pub fn transition(target: u32, transition: &Transition) -> String {
    match transition {
        Transition::Allowed => format!("✅ Phase {} may proceed", target),
        Transition::Blocked(reason) => format!("⛔ Phase {} may not proceed: {}", target, reason),
    }
}

/// Per-phase table for `verify-gates`
pub fn verification(verification: &BlockingVerification) -> String {
    let mut lines = vec!["Blocking phases:".to_string()];

    for phase in &verification.phases {
        let when = phase
            .last_run
            .map(|t| format!(" (last run {})", t.format("%Y-%m-%d %H:%M:%S")))
            .unwrap_or_default();
        lines.push(format!(
            "  {} {}. {}: {}{}",
            icon(phase.status),
            phase.phase,
            phase.name,
            phase.status,
            when
        ));
    }

    lines.push(String::new());
    if verification.all_passed() {
        lines.push("All blocking phases PASSED".to_string());
    } else {
        let outstanding: Vec<String> = verification
            .outstanding()
            .map(|p| p.phase.to_string())
            .collect();
        lines.push(format!(
            "NOT COMPLETE: phases {} have no passing gate result",
            outstanding.join(", ")
        ));
    }

    lines.join("\n")
}

/// Chronological attempt log
pub fn history(state: &OrchestrationState, phase: Option<u32>) -> String {
    let entries: Vec<String> = state
        .history
        .iter()
        .filter(|r| phase.map(|p| p == r.phase).unwrap_or(true))
        .map(|r| {
            let summary = first_line(&r.output_summary);
            if summary.is_empty() {
                result_line(r)
            } else {
                format!("{} | {}", result_line(r), summary)
            }
        })
        .collect();

    if entries.is_empty() {
        "No gate executions recorded".to_string()
    } else {
        entries.join("\n")
    }
}

/// Full output of a result, or why it isn't available
pub fn output(result: &GateResult, read: &OutputRead) -> String {
    match read {
        OutputRead::Available(text) => text.clone(),
        OutputRead::NotPersisted => format!(
            "Full output was not persisted for this run; summary:\n{}",
            result.output_summary
        ),
        OutputRead::Unreadable { path, reason } => format!(
            "Full output reference present but unreadable ({}: {}); summary:\n{}",
            path.display(),
            reason,
            result.output_summary
        ),
    }
}
