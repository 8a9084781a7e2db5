//! Process-backed sandbox: one throwaway directory and one process group per
//! execution.
//!
//! The child runs with a cleared environment, closed stdin and, when the
//! platform allows unprivileged network namespaces, no network.  Timeout and
//! output overflow both tear down the whole process group, so background
//! processes spawned by the candidate do not outlive the call.  A leader that
//! exits is classified at once; whatever it left running is killed.

use super::{
    scan_result_marker, MarkerScan, OutcomeStatus, ResourceLimits, SandboxExecutor, SandboxFault,
    TestHarness, TestOutcome,
};
use crate::artifact::CandidateArtifact;
use async_trait::async_trait;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Executes candidates as child processes.
///
/// # Panics
///
/// No methods on this type panic.
pub struct ProcessSandbox {
    isolate_network: bool,
    /// Probed once: whether `unshare --net` works for this user.
    network_wrapper: OnceCell<bool>,
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSandbox {
    pub fn new() -> Self {
        Self { isolate_network: true, network_wrapper: OnceCell::new() }
    }

    pub fn with_network_isolation(mut self, isolate: bool) -> Self {
        self.isolate_network = isolate;
        self
    }

    async fn use_network_wrapper(&self) -> bool {
        if !self.isolate_network {
            return false;
        }
        *self.network_wrapper.get_or_init(probe_unshare).await
    }

    async fn command(
        &self,
        harness: &TestHarness,
        dir: &Path,
        artifact_path: &Path,
        driver_path: &Path,
    ) -> Result<Command, SandboxFault> {
        let (program, args) = harness.interpreter.split_first().ok_or_else(|| SandboxFault::Spawn {
            reason: format!("harness '{}' has no interpreter", harness.name),
        })?;

        let mut command = if self.use_network_wrapper().await {
            let mut wrapped = Command::new("unshare");
            wrapped.args(["--net", "--map-root-user"]).arg(program);
            wrapped
        } else {
            Command::new(program)
        };
        command
            .args(args)
            .arg(driver_path)
            .current_dir(dir)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", dir)
            .env("ARTIFACT_PATH", artifact_path)
            .envs(harness.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        Ok(command)
    }

    /// Write the artifact and driver into `dir` and build the command.
    async fn prepare(
        &self,
        artifact: &CandidateArtifact,
        harness: &TestHarness,
        dir: &Path,
    ) -> Result<Command, SandboxFault> {
        let artifact_path = dir.join(&harness.artifact_file);
        let driver_path = dir.join(&harness.driver_file);
        tokio::fs::write(&artifact_path, &artifact.content).await.map_err(spawn_fault)?;
        tokio::fs::write(&driver_path, &harness.driver_source).await.map_err(spawn_fault)?;
        self.command(harness, dir, &artifact_path, &driver_path).await
    }

    async fn run(
        &self,
        artifact: &CandidateArtifact,
        harness: &TestHarness,
        limits: &ResourceLimits,
        started: Instant,
    ) -> Result<TestOutcome, SandboxFault> {
        // Setup and the run itself share one deadline.
        let deadline = tokio::time::Instant::from_std(started) + limits.timeout;
        let timed_out = |capture: &Capture| {
            warn!(
                harness = %harness.name,
                timeout_ms = limits.timeout.as_millis() as u64,
                "sandbox run timed out"
            );
            TestOutcome {
                status: OutcomeStatus::Timeout,
                captured_output: capture.render(),
                structured_result: None,
                duration: started.elapsed(),
                exit_code: None,
            }
        };

        // Dropped (and removed) on every return path below.
        let dir = tempfile::Builder::new()
            .prefix("evoagent-sandbox-")
            .tempdir()
            .map_err(spawn_fault)?;
        let mut command = match tokio::time::timeout_at(deadline, self.prepare(artifact, harness, dir.path())).await {
            Ok(command) => command?,
            Err(_elapsed) => return Ok(timed_out(&Capture::default())),
        };
        let mut child = command.spawn().map_err(spawn_fault)?;
        let group = child.id();

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            terminate(&mut child, group, limits.teardown_grace).await;
            return Err(SandboxFault::Spawn { reason: "stdio pipes unavailable".into() });
        };
        let mut pipes = Pipes::new(stdout, stderr);
        let mut capture = Capture::default();
        let overflow = |capture: &Capture| {
            warn!(harness = %harness.name, limit = limits.max_output_bytes, "sandbox output overflow");
            TestOutcome {
                status: OutcomeStatus::Error(SandboxFault::OutputOverflow { limit: limits.max_output_bytes }),
                captured_output: capture.render(),
                structured_result: None,
                duration: started.elapsed(),
                exit_code: None,
            }
        };

        let waited = tokio::time::timeout_at(
            deadline,
            wait_for_exit(&mut child, &mut pipes, &mut capture, limits.max_output_bytes),
        )
        .await;
        let exit = match waited {
            Err(_elapsed) => {
                terminate(&mut child, group, limits.teardown_grace).await;
                return Ok(timed_out(&capture));
            }
            Ok(Err(e)) => {
                terminate(&mut child, group, limits.teardown_grace).await;
                return Err(SandboxFault::Spawn { reason: format!("reading output: {}", e) });
            }
            Ok(Ok(None)) => {
                terminate(&mut child, group, limits.teardown_grace).await;
                return Ok(overflow(&capture));
            }
            Ok(Ok(Some(exit))) => exit,
        };

        // Leader is gone; sweep anything it left running in its group, then
        // collect whatever is still buffered in the pipes.
        kill_group(group);
        if !drain(&mut pipes, &mut capture, limits.max_output_bytes, limits.teardown_grace).await {
            return Ok(overflow(&capture));
        }
        let (status, structured_result) = classify(&capture.stdout_text(), exit);
        Ok(TestOutcome {
            status,
            captured_output: capture.render(),
            structured_result,
            duration: started.elapsed(),
            exit_code: exit.code(),
        })
    }
}

#[async_trait]
impl SandboxExecutor for ProcessSandbox {
    async fn execute(
        &self,
        artifact: &CandidateArtifact,
        harness: &TestHarness,
        limits: &ResourceLimits,
    ) -> TestOutcome {
        let started = Instant::now();
        let outcome = match self.run(artifact, harness, limits, started).await {
            Ok(outcome) => outcome,
            Err(fault) => TestOutcome::fault(fault, started.elapsed()),
        };
        debug!(
            harness = %harness.name,
            candidate = %artifact.fingerprint().short(),
            status = %outcome.status,
            elapsed_ms = outcome.duration.as_millis() as u64,
            "sandbox run finished"
        );
        outcome
    }
}

// ---------------------------------------------------------------------------
// Output capture
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Capture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Capture {
    fn len(&self) -> usize {
        self.stdout.len() + self.stderr.len()
    }

    fn clamp(&mut self, max: usize) {
        if self.stdout.len() >= max {
            self.stdout.truncate(max);
            self.stderr.clear();
        } else {
            self.stderr.truncate(max - self.stdout.len());
        }
    }

    fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    fn render(&self) -> String {
        let mut text = self.stdout_text();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str("[stderr]\n");
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        text
    }
}

// ---------------------------------------------------------------------------
// Pipes
// ---------------------------------------------------------------------------

struct Pipes {
    stdout: ChildStdout,
    stderr: ChildStderr,
    out_open: bool,
    err_open: bool,
}

impl Pipes {
    fn new(stdout: ChildStdout, stderr: ChildStderr) -> Self {
        Self { stdout, stderr, out_open: true, err_open: true }
    }

    fn is_open(&self) -> bool {
        self.out_open || self.err_open
    }

    /// One read from whichever open pipe is ready first.  Cancel safe: bytes
    /// reach `capture` only once a read has completed.
    async fn read_into(&mut self, capture: &mut Capture) -> std::io::Result<()> {
        let mut out_buf = [0u8; 4096];
        let mut err_buf = [0u8; 4096];
        tokio::select! {
            read = self.stdout.read(&mut out_buf), if self.out_open => {
                let n = read?;
                if n == 0 {
                    self.out_open = false;
                } else {
                    capture.stdout.extend_from_slice(&out_buf[..n]);
                }
            }
            read = self.stderr.read(&mut err_buf), if self.err_open => {
                let n = read?;
                if n == 0 {
                    self.err_open = false;
                } else {
                    capture.stderr.extend_from_slice(&err_buf[..n]);
                }
            }
            else => {}
        }
        Ok(())
    }
}

/// Pump both pipes until the leader exits.  `Ok(None)` means the output cap
/// was exceeded and the child is still running.
async fn wait_for_exit(
    child: &mut Child,
    pipes: &mut Pipes,
    capture: &mut Capture,
    max_output: usize,
) -> std::io::Result<Option<ExitStatus>> {
    loop {
        tokio::select! {
            status = child.wait() => return status.map(Some),
            read = pipes.read_into(capture), if pipes.is_open() => read?,
        }
        if capture.len() > max_output {
            capture.clamp(max_output);
            return Ok(None);
        }
    }
}

/// Read what is left after the leader exited, for at most `grace`.  Returns
/// `false` when the output cap was exceeded.
async fn drain(pipes: &mut Pipes, capture: &mut Capture, max_output: usize, grace: Duration) -> bool {
    let read_rest = async {
        while pipes.is_open() && capture.len() <= max_output {
            pipes.read_into(capture).await?;
        }
        Ok::<(), std::io::Error>(())
    };
    match tokio::time::timeout(grace, read_rest).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "sandbox pipe read failed after exit"),
        Err(_elapsed) => debug!("sandbox pipes still open after teardown grace"),
    }
    if capture.len() > max_output {
        capture.clamp(max_output);
        return false;
    }
    true
}

fn classify(stdout: &str, exit: ExitStatus) -> (OutcomeStatus, Option<serde_json::Value>) {
    let exit_code = exit.code();
    match scan_result_marker(stdout) {
        MarkerScan::Verdict { passed: false, payload } => (OutcomeStatus::Fail, Some(payload)),
        MarkerScan::Verdict { passed: true, payload } if exit.success() => {
            (OutcomeStatus::Pass, Some(payload))
        }
        // A pass claimed by a process that then died is not trusted.
        MarkerScan::Verdict { passed: true, payload } => {
            (OutcomeStatus::Error(SandboxFault::Crash { exit_code }), Some(payload))
        }
        MarkerScan::Malformed(reason) => {
            (OutcomeStatus::Error(SandboxFault::MalformedResult { reason }), None)
        }
        MarkerScan::Missing if exit.success() => (
            OutcomeStatus::Error(SandboxFault::MalformedResult {
                reason: "no result marker on stdout".into(),
            }),
            None,
        ),
        MarkerScan::Missing => (OutcomeStatus::Error(SandboxFault::Crash { exit_code }), None),
    }
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

async fn terminate(child: &mut Child, group: Option<u32>, grace: Duration) {
    kill_group(group);
    let _ = child.start_kill();
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!(pid = ?group, "sandbox process not reaped within teardown grace");
    }
}

#[cfg(unix)]
fn kill_group(group: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = group.and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "failed to signal sandbox process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_group: Option<u32>) {}

async fn probe_unshare() -> bool {
    let status = Command::new("unshare")
        .args(["--net", "--map-root-user", "true"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();
    match tokio::time::timeout(Duration::from_secs(2), status).await {
        Ok(Ok(s)) if s.success() => true,
        _ => {
            warn!("network namespaces unavailable; sandbox runs without network isolation");
            false
        }
    }
}

fn spawn_fault(e: std::io::Error) -> SandboxFault {
    SandboxFault::Spawn { reason: e.to_string() }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const PASS_LINE: &str = r#"echo '@@EVOAGENT-RESULT@@ {"passed": true}'"#;

    fn sandbox() -> ProcessSandbox {
        ProcessSandbox::new().with_network_isolation(false)
    }

    fn limits(timeout_ms: u64) -> ResourceLimits {
        ResourceLimits {
            timeout: Duration::from_millis(timeout_ms),
            teardown_grace: Duration::from_secs(2),
            max_output_bytes: 16 * 1024,
        }
    }

    async fn run_driver(driver: &str, artifact: &str) -> TestOutcome {
        let harness = TestHarness::shell("unit", driver);
        sandbox()
            .execute(&CandidateArtifact::code(artifact, "unit"), &harness, &limits(5_000))
            .await
    }

    // -----------------------------------------------------------------------
    // Verdicts
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_passing_harness_reports_pass() {
        let driver = format!(". \"$ARTIFACT_PATH\"\n[ \"$(greet)\" = hello ] && {}", PASS_LINE);
        let outcome = run_driver(&driver, "greet() { echo hello; }").await;
        assert_eq!(outcome.status, OutcomeStatus::Pass);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.structured_result.unwrap()["passed"], true);
    }

    #[tokio::test]
    async fn test_failing_verdict_reports_fail() {
        let outcome =
            run_driver(r#"echo '@@EVOAGENT-RESULT@@ {"passed": false}'; exit 1"#, "").await;
        assert_eq!(outcome.status, OutcomeStatus::Fail);
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_marker_is_crash() {
        let outcome = run_driver("echo boom >&2; exit 3", "").await;
        assert_eq!(
            outcome.status,
            OutcomeStatus::Error(SandboxFault::Crash { exit_code: Some(3) })
        );
        assert!(outcome.captured_output.contains("boom"));
    }

    #[tokio::test]
    async fn test_clean_exit_without_marker_is_malformed() {
        let outcome = run_driver("echo fine", "").await;
        assert!(matches!(
            outcome.status,
            OutcomeStatus::Error(SandboxFault::MalformedResult { .. })
        ));
    }

    #[tokio::test]
    async fn test_pass_marker_followed_by_crash_is_not_trusted() {
        let outcome = run_driver(&format!("{}\nexit 7", PASS_LINE), "").await;
        assert_eq!(
            outcome.status,
            OutcomeStatus::Error(SandboxFault::Crash { exit_code: Some(7) })
        );
    }

    // -----------------------------------------------------------------------
    // Limits
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_timeout_returns_within_deadline() {
        let harness = TestHarness::shell("slow", "sleep 30 &\nsleep 30");
        let started = Instant::now();
        let outcome = sandbox()
            .execute(&CandidateArtifact::code("", "t"), &harness, &limits(300))
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Timeout);
        assert!(started.elapsed() < Duration::from_millis(300) + Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_verdict_stands_when_background_process_keeps_stdout() {
        let harness = TestHarness::shell("lingering", format!("sleep 20 &\n{}\nexit 0", PASS_LINE));
        let started = Instant::now();
        let outcome = sandbox()
            .execute(&CandidateArtifact::code("", "t"), &harness, &limits(2_000))
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Pass);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(started.elapsed() < Duration::from_millis(1_500));
    }

    #[tokio::test]
    async fn test_setup_counts_against_timeout() {
        let harness = TestHarness::shell("instant", PASS_LINE);
        let started = Instant::now();
        let outcome = sandbox()
            .execute(&CandidateArtifact::code("", "t"), &harness, &limits(0))
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_output_overflow_kills_and_reports() {
        let harness = TestHarness::shell("chatty", "while :; do echo aaaaaaaaaaaaaaaaaaaaaaaa; done");
        let mut lim = limits(5_000);
        lim.max_output_bytes = 1024;
        let outcome = sandbox()
            .execute(&CandidateArtifact::code("", "t"), &harness, &lim)
            .await;
        assert_eq!(
            outcome.status,
            OutcomeStatus::Error(SandboxFault::OutputOverflow { limit: 1024 })
        );
        assert!(outcome.captured_output.len() <= 1024);
    }

    // -----------------------------------------------------------------------
    // Isolation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_runs_inside_fresh_directory_with_artifact() {
        let driver = format!("[ -f artifact.sh ] && [ \"$HOME\" = \"$(pwd)\" ] && {}", PASS_LINE);
        let outcome = run_driver(&driver, "# candidate").await;
        assert_eq!(outcome.status, OutcomeStatus::Pass);
    }

    #[tokio::test]
    async fn test_harness_env_is_passed_through() {
        let harness = TestHarness::shell("env", format!("[ \"$GREETING\" = hi ] && {}", PASS_LINE))
            .with_env("GREETING", "hi");
        let outcome = sandbox()
            .execute(&CandidateArtifact::code("", "t"), &harness, &limits(5_000))
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Pass);
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_spawn_fault() {
        let mut harness = TestHarness::shell("bad", "true");
        harness.interpreter = vec!["/nonexistent/interpreter".into()];
        let outcome = sandbox()
            .execute(&CandidateArtifact::code("", "t"), &harness, &limits(1_000))
            .await;
        assert!(matches!(outcome.status, OutcomeStatus::Error(SandboxFault::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_empty_interpreter_is_spawn_fault() {
        let mut harness = TestHarness::shell("bad", "true");
        harness.interpreter.clear();
        let outcome = sandbox()
            .execute(&CandidateArtifact::code("", "t"), &harness, &limits(1_000))
            .await;
        assert!(matches!(outcome.status, OutcomeStatus::Error(SandboxFault::Spawn { .. })));
    }

    #[test]
    fn test_capture_clamp_prefers_stdout() {
        let mut capture = Capture { stdout: vec![b'a'; 10], stderr: vec![b'b'; 10] };
        capture.clamp(12);
        assert_eq!(capture.stdout.len(), 10);
        assert_eq!(capture.stderr.len(), 2);
        assert_eq!(capture.len(), 12);
    }
}
