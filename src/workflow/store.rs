//! Durable storage for orchestration state
//!
//! The store is the only component that writes the state document. It
//! degrades a damaged document to a fresh state instead of failing, and
//! treats every write failure as fatal.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::state::{GateResult, OrchestrationState, ORCHESTRATION_VERSION};
use crate::{Config, Error, Result};

/// Attempts made to parse the state document before calling it corrupt
const LOAD_ATTEMPTS: usize = 3;

/// Pause between parse attempts, long enough for an in-flight rename
const LOAD_RETRY_DELAY: Duration = Duration::from_millis(25);

/// One gate execution, as handed to [`StateStore::record_gate`]
#[derive(Debug, Clone)]
pub struct GateRecord<'a> {
    pub phase: u32,
    pub passed: bool,
    pub exit_code: i32,
    pub duration_seconds: f64,
    /// Full combined output
    pub output: &'a str,
    /// Write the full output to a side file
    pub persist_output: bool,
}

/// Result of following a `full_output_file` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputRead {
    /// The result has no side file
    NotPersisted,
    /// Full output text
    Available(String),
    /// Reference present but the file could not be read
    Unreadable { path: PathBuf, reason: String },
}

/// Load/save access to one project's orchestration state.
///
/// Read-only consumers only ever call [`StateStore::load`] and
/// [`StateStore::read_output`].
pub trait StateStore: Send + Sync {
    /// Project root this store belongs to
    fn project_root(&self) -> &Path;

    /// Persisted state, or a fresh one if missing or unparseable
    fn load(&self) -> OrchestrationState;

    /// Load for a write. Stores may preserve a damaged document here
    /// before it is overwritten.
    fn load_for_update(&self) -> Result<OrchestrationState> {
        Ok(self.load())
    }

    /// Atomically overwrite the persisted state, refreshing `last_updated`
    fn save(&self, state: &mut OrchestrationState) -> Result<()>;

    /// Relative path of the side file for a phase execution
    fn output_ref(&self, phase: u32, timestamp: DateTime<Utc>) -> PathBuf;

    /// Write a side file at a relative path produced by `output_ref`
    fn write_output(&self, relative: &Path, output: &str) -> Result<()>;

    /// Remove a side file that no saved state refers to
    fn discard_output(&self, relative: &Path);

    /// Follow a result's side file reference
    fn read_output(&self, result: &GateResult) -> OutputRead;

    /// Replace the state with a fresh one bearing a new `started_at`
    fn reset(&self) -> Result<OrchestrationState> {
        let mut state = OrchestrationState::new(self.project_root());
        self.save(&mut state)?;
        Ok(state)
    }

    /// Record a gate execution. The single mutation entry point.
    ///
    /// Appends to history, overwrites the phase index, advances
    /// `current_phase` on a pass at or beyond it, then saves.
    fn record_gate(&self, record: GateRecord<'_>) -> Result<GateResult> {
        let mut state = self.load_for_update()?;
        let timestamp = Utc::now();

        let mut result = GateResult::new(
            record.phase,
            record.passed,
            record.exit_code,
            record.duration_seconds,
            record.output,
            timestamp,
        )?;

        if record.persist_output {
            let relative = self.output_ref(record.phase, timestamp);
            self.write_output(&relative, record.output)?;
            result.full_output_ref = Some(relative);
        }

        let before = state.current_phase;
        state.apply(result.clone());
        if let Err(e) = self.save(&mut state) {
            if let Some(relative) = &result.full_output_ref {
                self.discard_output(relative);
            }
            return Err(e);
        }

        info!(
            "Recorded phase {} gate: {} (exit code {}, {:.3}s)",
            result.phase,
            result.status(),
            result.exit_code,
            result.duration_seconds
        );
        if state.current_phase != before {
            info!("Advanced to phase {}", state.current_phase);
        }

        Ok(result)
    }
}

/// Side file name for a phase execution
fn output_file_name(phase: u32, timestamp: DateTime<Utc>) -> String {
    format!(
        "phase-{}-{}.log",
        phase,
        timestamp.format("%Y%m%dT%H%M%S%.3fZ")
    )
}

/// State stored as a JSON document under the project root
pub struct FileStateStore {
    project_root: PathBuf,
    state_dir: PathBuf,
    state_path: PathBuf,
    output_dir: PathBuf,
}

enum Document {
    Missing,
    Valid(OrchestrationState),
    Corrupt(String),
    /// Present but not readable (permissions, not a file)
    Unreadable(std::io::Error),
}

impl FileStateStore {
    /// Create a store for a project root using configured locations
    pub fn new(project_root: impl Into<PathBuf>, config: &Config) -> Self {
        let project_root = project_root.into();
        Self {
            state_path: project_root
                .join(&config.state_dir)
                .join(&config.state_file),
            state_dir: config.state_dir.clone(),
            output_dir: config.state_dir.join(&config.output_dir),
            project_root,
        }
    }

    /// Absolute path of the state document
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    fn read_document(&self) -> Document {
        let mut last_error = String::new();

        for attempt in 1..=LOAD_ATTEMPTS {
            match fs::read_to_string(&self.state_path) {
                Err(e) if e.kind() == ErrorKind::NotFound => return Document::Missing,
                Err(e) => return Document::Unreadable(e),
                Ok(content) => match serde_json::from_str::<OrchestrationState>(&content) {
                    Ok(state) => return Document::Valid(state),
                    Err(e) => last_error = format!("failed to parse: {}", e),
                },
            }

            if attempt < LOAD_ATTEMPTS {
                debug!(
                    "State document unparseable (attempt {}/{}), retrying: {}",
                    attempt, LOAD_ATTEMPTS, last_error
                );
                // Blocks the calling thread for at most
                // (LOAD_ATTEMPTS - 1) * LOAD_RETRY_DELAY; the store API is synchronous.
                std::thread::sleep(LOAD_RETRY_DELAY);
            }
        }

        Document::Corrupt(last_error)
    }

    fn checked(&self, state: OrchestrationState) -> OrchestrationState {
        if state.schema_version != ORCHESTRATION_VERSION {
            warn!(
                "State document {} has version {} (expected {})",
                self.state_path.display(),
                state.schema_version,
                ORCHESTRATION_VERSION
            );
        }
        if !state.is_consistent() {
            warn!(
                "State document {} has a phase index that disagrees with its history",
                self.state_path.display()
            );
        }
        state
    }

    fn stamped_path(&self, dir: &str, stem: &str) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        self.project_root
            .join(&self.state_dir)
            .join(dir)
            .join(format!("{}-{}.json", stem, stamp))
    }
}

impl StateStore for FileStateStore {
    fn project_root(&self) -> &Path {
        &self.project_root
    }

    fn load(&self) -> OrchestrationState {
        match self.read_document() {
            Document::Valid(state) => self.checked(state),
            Document::Missing => {
                debug!(
                    "No state document at {}, starting fresh",
                    self.state_path.display()
                );
                OrchestrationState::new(&self.project_root)
            }
            Document::Corrupt(reason) => {
                warn!(
                    "State document {} is corrupt ({}); treating as fresh state",
                    self.state_path.display(),
                    reason
                );
                OrchestrationState::new(&self.project_root)
            }
            Document::Unreadable(e) => {
                warn!(
                    "State document {} could not be read ({}); treating as fresh state",
                    self.state_path.display(),
                    e
                );
                OrchestrationState::new(&self.project_root)
            }
        }
    }

    fn load_for_update(&self) -> Result<OrchestrationState> {
        match self.read_document() {
            Document::Valid(state) => Ok(self.checked(state)),
            Document::Missing => Ok(OrchestrationState::new(&self.project_root)),
            Document::Unreadable(e) => Err(Error::Persistence(format!(
                "Failed to read state from {}: {}",
                self.state_path.display(),
                e
            ))),
            Document::Corrupt(reason) => {
                let quarantine = self.stamped_path("corrupt", "orchestration-state");
                if let Some(parent) = quarantine.parent() {
                    fs::create_dir_all(parent).map_err(|e| {
                        Error::Persistence(format!("Failed to create {}: {}", parent.display(), e))
                    })?;
                }
                fs::rename(&self.state_path, &quarantine).map_err(|e| {
                    Error::Persistence(format!(
                        "Failed to move corrupt state aside to {}: {}",
                        quarantine.display(),
                        e
                    ))
                })?;
                warn!(
                    "State document {} is corrupt ({}); moved to {} and starting fresh",
                    self.state_path.display(),
                    reason,
                    quarantine.display()
                );
                Ok(OrchestrationState::new(&self.project_root))
            }
        }
    }

    fn save(&self, state: &mut OrchestrationState) -> Result<()> {
        state.last_updated = Utc::now();

        let mut content = serde_json::to_string_pretty(state)
            .map_err(|e| Error::Persistence(format!("Failed to serialize state: {}", e)))?;
        content.push('\n');

        atomic_write(&self.state_path, content.as_bytes()).map_err(|e| {
            Error::Persistence(format!(
                "Failed to save state to {}: {}",
                self.state_path.display(),
                e
            ))
        })?;

        debug!("Saved state to {}", self.state_path.display());
        Ok(())
    }

    fn output_ref(&self, phase: u32, timestamp: DateTime<Utc>) -> PathBuf {
        self.output_dir.join(output_file_name(phase, timestamp))
    }

    fn write_output(&self, relative: &Path, output: &str) -> Result<()> {
        let path = self.project_root.join(relative);
        atomic_write(&path, output.as_bytes()).map_err(|e| {
            Error::Persistence(format!(
                "Failed to write gate output to {}: {}",
                path.display(),
                e
            ))
        })
    }

    fn discard_output(&self, relative: &Path) {
        let path = self.project_root.join(relative);
        if let Err(e) = fs::remove_file(&path) {
            debug!("Failed to remove gate output {}: {}", path.display(), e);
        }
    }

    fn read_output(&self, result: &GateResult) -> OutputRead {
        let Some(relative) = &result.full_output_ref else {
            return OutputRead::NotPersisted;
        };

        let path = self.project_root.join(relative);
        match fs::read(&path) {
            Ok(bytes) => OutputRead::Available(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => {
                warn!("Gate output {} unreadable: {}", path.display(), e);
                OutputRead::Unreadable {
                    path: relative.clone(),
                    reason: e.to_string(),
                }
            }
        }
    }

    fn reset(&self) -> Result<OrchestrationState> {
        if self.state_path.exists() {
            let archive = self.stamped_path("archive", "orchestration-state");
            if let Some(parent) = archive.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::Persistence(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
            fs::rename(&self.state_path, &archive).map_err(|e| {
                Error::Persistence(format!(
                    "Failed to archive state to {}: {}",
                    archive.display(),
                    e
                ))
            })?;
            info!("Archived previous state to {}", archive.display());
        }

        let mut state = OrchestrationState::new(&self.project_root);
        self.save(&mut state)?;
        info!("Orchestration state reset at {}", state.started_at);
        Ok(state)
    }
}

/// Atomic write using a temp file in the same directory and rename
fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

    let written = File::create(&temp_path).and_then(|mut file| {
        file.write_all(content)?;
        file.sync_all()
    });

    if let Err(e) = written.and_then(|_| fs::rename(&temp_path, path)) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    Ok(())
}

/// In-memory store for tests and embedding
pub struct MemoryStateStore {
    project_root: PathBuf,
    state: Mutex<Option<OrchestrationState>>,
    outputs: Mutex<HashMap<PathBuf, String>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStateStore {
    /// Create an empty store
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            state: Mutex::new(None),
            outputs: Mutex::new(HashMap::new()),
            fail_saves: AtomicBool::new(false),
            saves: AtomicUsize::new(0),
        }
    }

    /// Make every subsequent state save fail
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Number of side files currently held
    pub fn output_count(&self) -> usize {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl StateStore for MemoryStateStore {
    fn project_root(&self) -> &Path {
        &self.project_root
    }

    fn load(&self) -> OrchestrationState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| OrchestrationState::new(&self.project_root))
    }

    fn save(&self, state: &mut OrchestrationState) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Error::Persistence("store is not writable".to_string()));
        }
        state.last_updated = Utc::now();
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn output_ref(&self, phase: u32, timestamp: DateTime<Utc>) -> PathBuf {
        PathBuf::from("gate-outputs").join(output_file_name(phase, timestamp))
    }

    fn write_output(&self, relative: &Path, output: &str) -> Result<()> {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(relative.to_path_buf(), output.to_string());
        Ok(())
    }

    fn discard_output(&self, relative: &Path) {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(relative);
    }

    fn read_output(&self, result: &GateResult) -> OutputRead {
        let Some(relative) = &result.full_output_ref else {
            return OutputRead::NotPersisted;
        };

        match self
            .outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(relative)
        {
            Some(text) => OutputRead::Available(text.clone()),
            None => OutputRead::Unreadable {
                path: relative.clone(),
                reason: "no such output".to_string(),
            },
        }
    }
}
