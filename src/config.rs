//! Configuration loading and management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::workflow::phases::{default_phases, PhaseConfig, PhaseTable};
use crate::{Error, Result};

/// Directory (relative to the project root) holding phasegate files
pub const DEFAULT_STATE_DIR: &str = ".phasegate";

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// State directory, relative to the project root
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// State document file name inside `state_dir`
    #[serde(default = "default_state_file")]
    pub state_file: String,

    /// Gate output directory inside `state_dir`
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Hard wall-clock limit for every gate execution
    #[serde(default = "default_gate_timeout", with = "humantime_serde")]
    pub gate_timeout: Duration,

    /// Write the full output of each gate execution to a side file
    #[serde(default = "default_true")]
    pub persist_output: bool,

    /// Phase table
    #[serde(default = "default_phases")]
    pub phases: Vec<PhaseConfig>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

fn default_state_file() -> String {
    "orchestration-state.json".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("gate-outputs")
}

fn default_gate_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            state_file: default_state_file(),
            output_dir: default_output_dir(),
            gate_timeout: default_gate_timeout(),
            persist_output: true,
            phases: default_phases(),
        }
    }
}

impl Config {
    /// Load configuration from file or default locations
    pub fn load(path: Option<&Path>, project_root: &Path) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(|| {
            // Try .phasegate/config.toml in the project
            let local = project_root.join(DEFAULT_STATE_DIR).join("config.toml");
            if local.exists() {
                return Some(local);
            }

            // Try ~/.phasegate/config.toml
            dirs::home_dir().map(|h| h.join(".phasegate/config.toml"))
        });

        match config_path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(&p).map_err(|e| {
                    Error::Config(format!("Failed to read config {}: {}", p.display(), e))
                })?;
                Self::parse(&content)
            }
            Some(p) if path.is_some() => Err(Error::Config(format!(
                "Config file not found: {}",
                p.display()
            ))),
            _ => Ok(Config::default()),
        }
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the state machine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.gate_timeout.is_zero() {
            return Err(Error::Config("gate_timeout must be greater than zero".to_string()));
        }
        if self.state_file.trim().is_empty() {
            return Err(Error::Config("state_file must not be empty".to_string()));
        }
        if self.state_dir.is_absolute() || self.output_dir.is_absolute() {
            return Err(Error::Config(
                "state_dir and output_dir must be relative to the project root".to_string(),
            ));
        }
        self.phase_table().map(|_| ())
    }

    /// Validated phase table
    pub fn phase_table(&self) -> Result<PhaseTable> {
        PhaseTable::new(self.phases.clone())
    }
}

/// Write the default configuration for a project
pub fn init(project_root: &Path, force: bool) -> Result<Option<PathBuf>> {
    let path = project_root.join(DEFAULT_STATE_DIR).join("config.toml");

    if path.exists() && !force {
        return Ok(None);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = toml::to_string_pretty(&Config::default())
        .map_err(|e| Error::Config(e.to_string()))?;
    std::fs::write(&path, content)?;

    Ok(Some(path))
}

// Custom serde module for Duration using humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config = r#"
gate_timeout = "90s"
persist_output = false

[[phases]]
number = 1
name = "Design"

[[phases]]
number = 2
name = "Build"
gate = "gates/build.sh"
blocking = true
"#;

        let parsed = Config::parse(config).unwrap();
        assert_eq!(parsed.gate_timeout, Duration::from_secs(90));
        assert!(!parsed.persist_output);
        assert_eq!(parsed.state_dir, PathBuf::from(".phasegate"));

        let table = parsed.phase_table().unwrap();
        assert_eq!(table.total(), 2);
        assert_eq!(table.blocking().count(), 1);
        assert_eq!(
            table.get(2).unwrap().gate,
            Some(PathBuf::from("gates/build.sh"))
        );
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let parsed = Config::parse("").unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_malformed_phase_table_is_config_error() {
        let config = r#"
[[phases]]
number = 2
name = "Orphan"
"#;
        assert!(matches!(Config::parse(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_bad_timeout_rejected() {
        assert!(Config::parse("gate_timeout = \"soon\"").is_err());
        assert!(Config::parse("gate_timeout = \"0s\"").is_err());
    }

    #[test]
    fn test_default_round_trips_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        assert_eq!(Config::parse(&text).unwrap(), Config::default());
    }

    #[test]
    fn test_init_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        assert!(init(dir.path(), false).unwrap().is_some());
        assert!(init(dir.path(), false).unwrap().is_none());
        assert!(init(dir.path(), true).unwrap().is_some());

        let loaded = Config::load(None, dir.path()).unwrap();
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn test_explicit_missing_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::load(Some(&missing), dir.path()).is_err());
    }
}
