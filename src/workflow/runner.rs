//! Gate execution
//!
//! Runs a phase's gate executable as a subprocess with:
//! - The project root as working directory and sole argument
//! - A hard wall-clock timeout, after which the whole process group is killed
//! - stdout and stderr captured into one buffer in arrival order
//!
//! Every branch, including "no gate", timeouts and spawn failures, ends in
//! exactly one recorded [`GateResult`].

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use super::state::{GateResult, EXIT_CODE_RUNNER_ERROR, EXIT_CODE_TIMEOUT};
use super::store::{GateRecord, StateStore};
use crate::{Config, Result};

/// Read buffer size per stream
const READ_CHUNK: usize = 8 * 1024;

/// How long to keep reading after the gate exits while its pipes stay open
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Spawn attempts when the freshly written gate is still busy
const SPAWN_ATTEMPTS: usize = 3;

/// Runs gate executables and records their results
pub struct GateRunner {
    store: Arc<dyn StateStore>,
    timeout: Duration,
    persist_output: bool,
}

/// How a gate execution ended
enum Execution {
    Exited {
        status: ExitStatus,
        output: Vec<u8>,
    },
    TimedOut {
        output: Vec<u8>,
    },
    Failed {
        stage: &'static str,
        error: io::Error,
        output: Vec<u8>,
    },
}

impl GateRunner {
    /// Create a runner with a fixed timeout
    pub fn new(store: Arc<dyn StateStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            persist_output: true,
        }
    }

    /// Create a runner from application configuration
    pub fn from_config(store: Arc<dyn StateStore>, config: &Config) -> Self {
        Self::new(store, config.gate_timeout).with_persist_output(config.persist_output)
    }

    /// Whether executed gates get a full-output side file
    pub fn with_persist_output(mut self, persist_output: bool) -> Self {
        self.persist_output = persist_output;
        self
    }

    /// Run the gate for a phase and record the result.
    ///
    /// Only persistence failures are errors; gate failures are results.
    pub async fn run(&self, phase: u32, gate: Option<&Path>) -> Result<GateResult> {
        let gate = match gate {
            Some(path) if path.exists() => path,
            Some(path) => {
                let message = format!(
                    "No gate configured for phase {}: {} does not exist; passing through",
                    phase,
                    path.display()
                );
                return self.pass_through(phase, &message);
            }
            None => {
                let message = format!("No gate configured for phase {}; passing through", phase);
                return self.pass_through(phase, &message);
            }
        };

        let root = self.store.project_root().to_path_buf();
        info!("Running phase {} gate: {}", phase, gate.display());

        let started = Instant::now();
        let execution = execute(gate, &root, self.timeout).await;
        let elapsed = started.elapsed();

        let (exit_code, output) = match execution {
            Execution::Exited { status, output } => {
                let code = exit_code(status);
                let mut text = String::from_utf8_lossy(&output).into_owned();
                if status.code().is_none() {
                    text.push_str(&format!(
                        "\n[phasegate] gate terminated by signal (recorded exit code {})\n",
                        code
                    ));
                }
                (code, text)
            }
            Execution::TimedOut { output } => {
                warn!(
                    "Phase {} gate timed out after {:.1}s",
                    phase,
                    elapsed.as_secs_f64()
                );
                let text = format!(
                    "[phasegate] gate timed out after {:.1}s (limit {}); process group killed\n{}",
                    elapsed.as_secs_f64(),
                    humantime::format_duration(self.timeout),
                    String::from_utf8_lossy(&output)
                );
                (EXIT_CODE_TIMEOUT, text)
            }
            Execution::Failed {
                stage,
                error,
                output,
            } => {
                warn!("Phase {} gate could not run: {}", phase, error);
                let text = format!(
                    "[phasegate] gate {} failed for {}: {}\n{}",
                    stage,
                    gate.display(),
                    error,
                    String::from_utf8_lossy(&output)
                );
                (EXIT_CODE_RUNNER_ERROR, text)
            }
        };

        self.store.record_gate(GateRecord {
            phase,
            passed: exit_code == 0,
            exit_code,
            duration_seconds: elapsed.as_secs_f64(),
            output: &output,
            persist_output: self.persist_output,
        })
    }

    fn pass_through(&self, phase: u32, message: &str) -> Result<GateResult> {
        info!("{}", message);
        self.store.record_gate(GateRecord {
            phase,
            passed: true,
            exit_code: 0,
            duration_seconds: 0.0,
            output: message,
            persist_output: false,
        })
    }
}

/// Spawn the gate and wait for it under the timeout
async fn execute(gate: &Path, root: &Path, timeout: Duration) -> Execution {
    let mut child = match spawn(gate, root).await {
        Ok(child) => child,
        Err(error) => {
            return Execution::Failed {
                stage: "start",
                error,
                output: Vec::new(),
            }
        }
    };
    let pid = child.id();
    debug!("Gate {} started (pid {:?})", gate.display(), pid);

    let deadline = Instant::now() + timeout;
    let mut output = Vec::new();
    match capture(&mut child, &mut output, deadline).await {
        Ok(Capture::Exited { status, lingering }) => {
            if lingering {
                debug!("Gate exited with descendants still holding its output open");
                kill_group(pid);
            }
            Execution::Exited { status, output }
        }
        Ok(Capture::DeadlineReached) => {
            terminate(&mut child, pid).await;
            Execution::TimedOut { output }
        }
        Err(error) => {
            terminate(&mut child, pid).await;
            Execution::Failed {
                stage: "output capture",
                error,
                output,
            }
        }
    }
}

async fn spawn(gate: &Path, root: &Path) -> io::Result<Child> {
    let mut attempt = 1;
    loop {
        let mut std_cmd = std::process::Command::new(gate);
        std_cmd
            .arg(root)
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group so a timeout can take down the whole tree
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);

        match cmd.spawn() {
            // ETXTBSY: a concurrent fork still holds the script open for writing
            Err(e) if is_text_busy(&e) && attempt < SPAWN_ATTEMPTS => {
                debug!("Gate {} busy, retrying spawn", gate.display());
                attempt += 1;
                sleep(Duration::from_millis(50)).await;
            }
            other => return other,
        }
    }
}

#[cfg(unix)]
fn is_text_busy(error: &io::Error) -> bool {
    error.raw_os_error() == Some(nix::errno::Errno::ETXTBSY as i32)
}

#[cfg(not(unix))]
fn is_text_busy(_error: &io::Error) -> bool {
    false
}

/// How output capture ended
enum Capture {
    /// The gate exited before the deadline. `lingering` is set when its
    /// pipes were still open after the drain grace period.
    Exited { status: ExitStatus, lingering: bool },
    /// The deadline passed while the gate was still running
    DeadlineReached,
}

/// Read stdout and stderr into `output` while waiting for the gate to exit.
///
/// The deadline only bounds the gate itself. Once it has exited, leftover
/// output is drained for at most `DRAIN_GRACE`, so descendants holding the
/// pipes open never turn a real exit into a timeout.
async fn capture(
    child: &mut Child,
    output: &mut Vec<u8>,
    deadline: Instant,
) -> io::Result<Capture> {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];

    let status = loop {
        tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf) => {
                append(read?, &mut stdout, &out_buf, output);
            }
            read = read_chunk(&mut stderr, &mut err_buf) => {
                append(read?, &mut stderr, &err_buf, output);
            }
            exited = child.wait() => break exited?,
            _ = sleep_until(deadline) => return Ok(Capture::DeadlineReached),
        }
    };

    let drain_deadline = Instant::now() + DRAIN_GRACE;
    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf) => {
                append(read?, &mut stdout, &out_buf, output);
            }
            read = read_chunk(&mut stderr, &mut err_buf) => {
                append(read?, &mut stderr, &err_buf, output);
            }
            _ = sleep_until(drain_deadline) => {
                return Ok(Capture::Exited { status, lingering: true });
            }
        }
    }

    Ok(Capture::Exited {
        status,
        lingering: false,
    })
}

/// Append a chunk, or close the stream on EOF
fn append<R>(read: usize, reader: &mut Option<R>, buf: &[u8], output: &mut Vec<u8>) {
    match read {
        0 => *reader = None,
        n => output.extend_from_slice(&buf[..n]),
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Kill the gate's process group and reap the gate itself
async fn terminate(child: &mut Child, pid: Option<u32>) {
    kill_group(pid);
    if let Err(e) = child.kill().await {
        debug!("Failed to kill gate process: {}", e);
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!("killpg({}) failed: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

/// Exit code to record; signals map to the shell's 128+N convention
fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(EXIT_CODE_RUNNER_ERROR)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::workflow::state::PhaseStatus;
    use crate::workflow::store::{MemoryStateStore, OutputRead};
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_gate(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn runner(dir: &TempDir, timeout: Duration) -> (Arc<MemoryStateStore>, GateRunner) {
        let store = Arc::new(MemoryStateStore::new(dir.path()));
        let runner = GateRunner::new(store.clone(), timeout);
        (store, runner)
    }

    #[tokio::test]
    async fn test_passing_gate_advances() {
        let dir = tempfile::tempdir().unwrap();
        let gate = write_gate(&dir, "gate.sh", "sleep 0.2\necho OK");
        let (store, runner) = runner(&dir, Duration::from_secs(10));

        let result = runner.run(5, Some(&gate)).await.unwrap();
        assert!(result.passed);
        assert_eq!(result.exit_code, 0);
        assert!(result.output_summary.contains("OK"));
        assert!(result.duration_seconds >= 0.2);

        let state = store.load();
        assert_eq!(state.current_phase, 6);
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.phase_status(5), PhaseStatus::Passed);
    }

    #[tokio::test]
    async fn test_failing_gate_records_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let gate = write_gate(&dir, "gate.sh", "echo 'pass rate 92%'\nexit 3");
        let (store, runner) = runner(&dir, Duration::from_secs(10));

        let result = runner.run(2, Some(&gate)).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.exit_code, 3);
        assert!(result.output_summary.contains("pass rate 92%"));
        assert_eq!(store.load().current_phase, 1);
    }

    #[tokio::test]
    async fn test_stdout_and_stderr_combined() {
        let dir = tempfile::tempdir().unwrap();
        let gate = write_gate(&dir, "gate.sh", "echo to-stdout\nsleep 0.1\necho to-stderr 1>&2");
        let (store, runner) = runner(&dir, Duration::from_secs(10));

        let result = runner.run(1, Some(&gate)).await.unwrap();
        let out = result.output_summary.find("to-stdout").unwrap();
        let err = result.output_summary.find("to-stderr").unwrap();
        assert!(out < err);

        match store.read_output(&result) {
            OutputRead::Available(text) => assert!(text.contains("to-stderr")),
            other => panic!("expected persisted output, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_gate_receives_root_as_cwd_and_argument() {
        let dir = tempfile::tempdir().unwrap();
        let gate = write_gate(&dir, "gate.sh", "printf '%s' \"$1\" > received-arg.txt");
        let (_store, runner) = runner(&dir, Duration::from_secs(10));

        assert!(runner.run(1, Some(&gate)).await.unwrap().passed);
        let received = std::fs::read_to_string(dir.path().join("received-arg.txt")).unwrap();
        assert_eq!(PathBuf::from(received), dir.path());
    }

    #[tokio::test]
    async fn test_timeout_is_recorded_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let gate = write_gate(&dir, "gate.sh", "echo starting\nsleep 30");
        let (store, runner) = runner(&dir, Duration::from_millis(300));

        let started = std::time::Instant::now();
        let result = runner.run(5, Some(&gate)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));

        assert!(!result.passed);
        assert!(result.timed_out());
        assert_eq!(result.exit_code, EXIT_CODE_TIMEOUT);
        assert!(result.output_summary.contains("timed out"));
        assert!(result.output_summary.contains("starting"));
        assert_eq!(store.load().current_phase, 1);
        assert_eq!(store.load().history.len(), 1);
    }

    #[tokio::test]
    async fn test_background_child_does_not_turn_exit_into_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let gate = write_gate(&dir, "gate.sh", "sleep 5 &\necho done\nexit 0");
        let (store, runner) = runner(&dir, Duration::from_millis(300));

        let started = std::time::Instant::now();
        let result = runner.run(3, Some(&gate)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        assert!(result.passed);
        assert_eq!(result.exit_code, 0);
        assert!(!result.timed_out());
        assert!(result.output_summary.contains("done"));
        assert!(!result.output_summary.contains("timed out"));
        assert_eq!(store.load().current_phase, 4);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let gate = write_gate(&dir, "gate.sh", "sleep 30 &\necho $! > child.pid\nwait");
        let (_store, runner) = runner(&dir, Duration::from_millis(500));

        let result = runner.run(3, Some(&gate)).await.unwrap();
        assert!(result.timed_out());

        let pid = std::fs::read_to_string(dir.path().join("child.pid")).unwrap();
        let stat = PathBuf::from(format!("/proc/{}/stat", pid.trim()));

        // Killed children may linger briefly as zombies until reparented and reaped
        let mut alive = true;
        for _ in 0..20 {
            alive = match std::fs::read_to_string(&stat) {
                Ok(content) => !content.contains(") Z ") && !content.contains(") X "),
                Err(_) => false,
            };
            if !alive {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive, "background child survived the timeout");
    }

    #[tokio::test]
    async fn test_missing_gate_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let (store, runner) = runner(&dir, Duration::from_secs(10));
        let missing = dir.path().join("scripts/gates/phase2_gate.sh");

        let result = runner.run(2, Some(&missing)).await.unwrap();
        assert!(result.passed);
        assert_eq!(result.exit_code, 0);
        assert!(result.output_summary.contains("No gate configured"));
        assert!(result.full_output_ref.is_none());
        assert_eq!(store.load().history.len(), 1);
    }

    #[tokio::test]
    async fn test_unconfigured_gate_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let (store, runner) = runner(&dir, Duration::from_secs(10));

        let result = runner.run(1, None).await.unwrap();
        assert!(result.passed);
        assert_eq!(store.load().current_phase, 2);
    }

    #[tokio::test]
    async fn test_unstartable_gate_is_runner_error() {
        let dir = tempfile::tempdir().unwrap();
        let gate = dir.path().join("gate.sh");
        std::fs::write(&gate, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&gate, std::fs::Permissions::from_mode(0o644)).unwrap();
        let (store, runner) = runner(&dir, Duration::from_secs(10));

        let result = runner.run(4, Some(&gate)).await.unwrap();
        assert!(!result.passed);
        assert!(result.runner_error());
        assert!(result.output_summary.contains("start failed"));
        assert_eq!(store.load().phase_status(4), PhaseStatus::Failed);
    }

    #[tokio::test]
    async fn test_signal_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let gate = write_gate(&dir, "gate.sh", "kill -9 $$");
        let (_store, runner) = runner(&dir, Duration::from_secs(10));

        let result = runner.run(1, Some(&gate)).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.exit_code, 128 + 9);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let gate = write_gate(&dir, "gate.sh", "exit 0");
        let (store, runner) = runner(&dir, Duration::from_secs(10));
        store.fail_saves(true);

        assert!(runner.run(1, Some(&gate)).await.is_err());
    }
}
