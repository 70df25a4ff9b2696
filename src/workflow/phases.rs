//! Phase table: which phases exist, which gate guards each, which block completion

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Configuration for a single phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Phase number (1-based, contiguous)
    pub number: u32,
    /// Human-readable name
    pub name: String,
    /// Gate executable, relative to the project root. None = pass-through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<PathBuf>,
    /// Must pass before the project can be declared complete
    #[serde(default)]
    pub blocking: bool,
}

/// Validated, ordered phase table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTable {
    phases: Vec<PhaseConfig>,
}

impl PhaseTable {
    /// Validate and build a table. Phases may be given in any order but
    /// must cover `1..=N` exactly once.
    pub fn new(mut phases: Vec<PhaseConfig>) -> Result<Self> {
        if phases.is_empty() {
            return Err(Error::Config("at least one phase must be configured".to_string()));
        }

        phases.sort_by_key(|p| p.number);

        for (i, phase) in phases.iter().enumerate() {
            let expected = i as u32 + 1;
            if phase.number != expected {
                return Err(Error::Config(format!(
                    "phases must be numbered 1..={} without gaps or duplicates (found {} where {} was expected)",
                    phases.len(),
                    phase.number,
                    expected
                )));
            }
            if phase.name.trim().is_empty() {
                return Err(Error::Config(format!("phase {} has an empty name", phase.number)));
            }
            if let Some(gate) = &phase.gate {
                if gate.as_os_str().is_empty() {
                    return Err(Error::Config(format!(
                        "phase {} has an empty gate path",
                        phase.number
                    )));
                }
            }
        }

        Ok(Self { phases })
    }

    /// Total phase count
    pub fn total(&self) -> u32 {
        self.phases.len() as u32
    }

    /// Look up a phase, failing for numbers outside the table
    pub fn get(&self, phase: u32) -> Result<&PhaseConfig> {
        phase
            .checked_sub(1)
            .and_then(|i| self.phases.get(i as usize))
            .ok_or(Error::UnknownPhase {
                phase,
                total: self.total(),
            })
    }

    /// Phase display name, falling back to the number
    pub fn name(&self, phase: u32) -> String {
        self.get(phase)
            .map(|p| p.name.clone())
            .unwrap_or_else(|_| format!("Phase {}", phase))
    }

    /// All phases in order
    pub fn iter(&self) -> impl Iterator<Item = &PhaseConfig> {
        self.phases.iter()
    }

    /// Phases that must pass before completion
    pub fn blocking(&self) -> impl Iterator<Item = &PhaseConfig> {
        self.phases.iter().filter(|p| p.blocking)
    }

    /// Absolute gate path for a phase, if one is configured
    pub fn gate_path(&self, project_root: &Path, phase: u32) -> Result<Option<PathBuf>> {
        Ok(self.get(phase)?.gate.as_ref().map(|gate| {
            if gate.is_absolute() {
                gate.clone()
            } else {
                project_root.join(gate)
            }
        }))
    }
}

/// Default six-phase delivery table
pub fn default_phases() -> Vec<PhaseConfig> {
    let names = [
        "Planning",
        "Contracts",
        "Implementation",
        "Unit Testing",
        "Integration Testing",
        "Completion",
    ];

    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let number = i as u32 + 1;
            let gated = number >= 3;
            PhaseConfig {
                number,
                name: name.to_string(),
                gate: gated.then(|| PathBuf::from(format!("scripts/gates/phase{}_gate.sh", number))),
                blocking: gated,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(number: u32) -> PhaseConfig {
        PhaseConfig {
            number,
            name: format!("P{}", number),
            gate: None,
            blocking: false,
        }
    }

    #[test]
    fn test_default_table() {
        let table = PhaseTable::new(default_phases()).unwrap();
        assert_eq!(table.total(), 6);

        let blocking: Vec<u32> = table.blocking().map(|p| p.number).collect();
        assert_eq!(blocking, vec![3, 4, 5, 6]);

        assert!(table.get(1).unwrap().gate.is_none());
        assert_eq!(
            table.gate_path(Path::new("/repo"), 5).unwrap(),
            Some(PathBuf::from("/repo/scripts/gates/phase5_gate.sh"))
        );
    }

    #[test]
    fn test_unknown_phase() {
        let table = PhaseTable::new(default_phases()).unwrap();
        assert!(matches!(
            table.get(0),
            Err(Error::UnknownPhase { phase: 0, total: 6 })
        ));
        assert!(matches!(
            table.get(7),
            Err(Error::UnknownPhase { phase: 7, total: 6 })
        ));
    }

    #[test]
    fn test_unordered_input_is_sorted() {
        let table = PhaseTable::new(vec![phase(2), phase(1)]).unwrap();
        let order: Vec<u32> = table.iter().map(|p| p.number).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn test_gaps_and_duplicates_rejected() {
        assert!(PhaseTable::new(vec![phase(1), phase(3)]).is_err());
        assert!(PhaseTable::new(vec![phase(1), phase(1)]).is_err());
        assert!(PhaseTable::new(vec![]).is_err());
    }

    #[test]
    fn test_empty_gate_rejected() {
        let mut p = phase(1);
        p.gate = Some(PathBuf::new());
        assert!(matches!(PhaseTable::new(vec![p]), Err(Error::Config(_))));
    }
}
