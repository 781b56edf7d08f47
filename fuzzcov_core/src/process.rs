use std::collections::BTreeMap;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_OUTPUT_GRACE: Duration = Duration::from_secs(5);

/// Shared flag that asks every runner holding a clone to abandon its child.
///
/// Cancelling is sticky: once set, every later `run` returns
/// [`RunOutcome::Cancelled`] without spawning anything.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Captured output of a child that did not exit cleanly.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessOutput {
    pub fn describe(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("Exited with code {code}"),
            (None, Some(signal)) => format!("Terminated by signal {signal}"),
            (None, None) => "Exited abnormally".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    TimedOut(Duration),
    NonZeroExit(ProcessOutput),
    /// The binary could not be started at all (missing, not executable, ...).
    LaunchFailed(String),
    Cancelled,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }
}

/// Runs one external command to completion or until its deadline.
///
/// Implementations never panic and never return an error: every way a child
/// can end is folded into a [`RunOutcome`].
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        command: &[String],
        env: &BTreeMap<String, String>,
        timeout: Duration,
        annotation: &str,
    ) -> RunOutcome;
}

/// [`CommandRunner`] backed by real OS processes.
///
/// Each child is placed in its own process group so that a timeout can take
/// down anything the harness forked as well. A descendant that leaves the
/// group (e.g. via `setsid`) survives the kill; if it keeps the output pipes
/// open, whatever it has not written within the output grace period is
/// dropped and its reader thread is left to finish on its own.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    cancel: CancelToken,
    poll_interval: Duration,
    output_grace: Duration,
}

enum Waited {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(std::io::Error),
}

impl ProcessRunner {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            cancel,
            poll_interval: DEFAULT_POLL_INTERVAL,
            output_grace: DEFAULT_OUTPUT_GRACE,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// How long to keep collecting output after the child is gone.
    pub fn with_output_grace(mut self, output_grace: Duration) -> Self {
        self.output_grace = output_grace;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn wait_with_deadline(&self, child: &mut Child, timeout: Duration) -> Waited {
        // A timeout too large to represent means "no deadline".
        let deadline = Instant::now().checked_add(timeout);
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Waited::Exited(status),
                Ok(None) => {
                    if self.cancel.is_cancelled() {
                        return Waited::Cancelled;
                    }
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return Waited::TimedOut;
                    }
                    thread::sleep(self.poll_interval);
                }
                Err(e) => return Waited::WaitFailed(e),
            }
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(CancelToken::new())
    }
}

impl CommandRunner for ProcessRunner {
    fn run(
        &self,
        command: &[String],
        env: &BTreeMap<String, String>,
        timeout: Duration,
        annotation: &str,
    ) -> RunOutcome {
        let rendered = render_command(command);
        info!(command = %rendered, annotation, "Trying command");

        if self.cancel.is_cancelled() {
            return RunOutcome::Cancelled;
        }
        let Some((program, args)) = command.split_first() else {
            return RunOutcome::LaunchFailed("empty command line".to_string());
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("Failed to spawn command '{rendered}': {e}");
                warn!(annotation, error = %e, "{reason}");
                return RunOutcome::LaunchFailed(reason);
            }
        };

        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        let waited = self.wait_with_deadline(&mut child, timeout);
        // Forked helpers may still hold the fragment file or the pipes open.
        kill_process_group(&mut child);
        if !matches!(waited, Waited::Exited(_)) {
            let _ = child.wait();
        }

        let output_deadline = Instant::now().checked_add(self.output_grace);
        let stdout = collect_output(&stdout_reader, output_deadline, &rendered);
        let stderr = collect_output(&stderr_reader, output_deadline, &rendered);

        match waited {
            Waited::Exited(status) if status.success() => {
                debug!(command = %rendered, annotation, "command succeeded");
                RunOutcome::Success
            }
            Waited::Exited(status) => {
                let output = ProcessOutput {
                    stdout,
                    stderr,
                    exit_code: status.code(),
                    signal: exit_signal(&status),
                };
                warn!(
                    command = %rendered,
                    annotation,
                    status = %output.describe(),
                    stdout = %String::from_utf8_lossy(&output.stdout),
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "command failed"
                );
                RunOutcome::NonZeroExit(output)
            }
            Waited::TimedOut => {
                warn!(
                    command = %rendered,
                    annotation,
                    "command timed out after {} seconds",
                    timeout.as_secs_f64()
                );
                RunOutcome::TimedOut(timeout)
            }
            Waited::Cancelled => {
                info!(command = %rendered, annotation, "command cancelled");
                RunOutcome::Cancelled
            }
            Waited::WaitFailed(e) => {
                warn!(command = %rendered, annotation, error = %e, "error waiting for child");
                RunOutcome::NonZeroExit(ProcessOutput {
                    stdout,
                    stderr,
                    exit_code: None,
                    signal: None,
                })
            }
        }
    }
}

pub fn render_command(command: &[String]) -> String {
    command.join(" ")
}

fn spawn_reader<R: Read + Send + 'static>(stream: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

fn collect_output(reader: &Receiver<Vec<u8>>, deadline: Option<Instant>, rendered: &str) -> Vec<u8> {
    let Some(deadline) = deadline else {
        return reader.recv().unwrap_or_default();
    };
    let remaining = deadline.saturating_duration_since(Instant::now());
    match reader.recv_timeout(remaining) {
        Ok(buf) => buf,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            warn!(command = %rendered, "output pipe still held open by a detached process, giving up on it");
            Vec::new()
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Vec::new(),
    }
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: killpg only sends a signal; ESRCH for an already empty group is ignored.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn runner() -> ProcessRunner {
        ProcessRunner::default().with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn successful_command_reports_success() {
        let outcome = runner().run(&sh("exit 0"), &BTreeMap::new(), Duration::from_secs(5), "ok");
        assert_eq!(outcome, RunOutcome::Success);
    }

    #[test]
    fn non_zero_exit_captures_output() {
        let outcome = runner().run(
            &sh("echo out; echo err >&2; exit 3"),
            &BTreeMap::new(),
            Duration::from_secs(5),
            "failing",
        );
        match outcome {
            RunOutcome::NonZeroExit(output) => {
                assert_eq!(output.exit_code, Some(3));
                assert_eq!(output.stdout, b"out\n");
                assert_eq!(output.stderr, b"err\n");
                assert_eq!(output.describe(), "Exited with code 3");
            }
            other => panic!("Expected NonZeroExit, got {other:?}"),
        }
    }

    #[test]
    fn signal_death_is_a_non_zero_exit() {
        let outcome = runner().run(&sh("kill -SEGV $$"), &BTreeMap::new(), Duration::from_secs(5), "segv");
        match outcome {
            RunOutcome::NonZeroExit(output) => {
                assert_eq!(output.exit_code, None);
                assert_eq!(output.signal, Some(libc::SIGSEGV));
            }
            other => panic!("Expected NonZeroExit, got {other:?}"),
        }
    }

    #[test]
    fn env_overlay_reaches_child() {
        let mut env = BTreeMap::new();
        env.insert("FUZZCOV_PROBE".to_string(), "42".to_string());
        let outcome = runner().run(
            &sh("test \"$FUZZCOV_PROBE\" = 42"),
            &env,
            Duration::from_secs(5),
            "env",
        );
        assert_eq!(outcome, RunOutcome::Success);
    }

    #[test]
    fn timeout_kills_the_whole_process_group() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("grandchild-survived");
        let script = format!(
            "(sleep 1; touch '{}') & sleep 30",
            marker.display()
        );
        let started = Instant::now();
        let outcome = runner().run(&sh(&script), &BTreeMap::new(), Duration::from_millis(200), "slow");
        assert_eq!(outcome, RunOutcome::TimedOut(Duration::from_millis(200)));
        assert!(started.elapsed() < Duration::from_secs(10));

        thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists(), "forked helper outlived the timeout");
    }

    #[test]
    fn unrepresentable_timeout_means_no_deadline() {
        let outcome = runner().run(&sh("exit 0"), &BTreeMap::new(), Duration::MAX, "forever");
        assert_eq!(outcome, RunOutcome::Success);
    }

    #[test]
    fn detached_descendant_holding_stdout_does_not_block() {
        let runner = runner().with_output_grace(Duration::from_millis(200));
        let started = Instant::now();
        let outcome = runner.run(
            &sh("command -v setsid >/dev/null || exit 0; setsid sleep 5 & echo early; exit 0"),
            &BTreeMap::new(),
            Duration::from_secs(10),
            "detached",
        );
        assert_eq!(outcome, RunOutcome::Success);
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "waited {:?} for a detached process",
            started.elapsed()
        );
    }

    #[test]
    fn missing_binary_is_launch_failure() {
        let command = vec!["./this_command_does_not_exist_ever_12345".to_string()];
        match runner().run(&command, &BTreeMap::new(), Duration::from_secs(1), "missing") {
            RunOutcome::LaunchFailed(msg) => assert!(msg.contains("Failed to spawn command")),
            other => panic!("Expected LaunchFailed, got {other:?}"),
        }
    }

    #[test]
    fn empty_command_is_launch_failure() {
        let outcome = runner().run(&[], &BTreeMap::new(), Duration::from_secs(1), "empty");
        assert!(matches!(outcome, RunOutcome::LaunchFailed(_)));
    }

    #[test]
    fn cancelled_token_skips_spawn() {
        let runner = runner();
        runner.cancel_token().cancel();
        let outcome = runner.run(&sh("exit 0"), &BTreeMap::new(), Duration::from_secs(1), "cancelled");
        assert_eq!(outcome, RunOutcome::Cancelled);
    }

    #[test]
    fn cancel_during_run_stops_child() {
        let runner = runner();
        let token = runner.cancel_token().clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            token.cancel();
        });
        let outcome = runner.run(&sh("sleep 30"), &BTreeMap::new(), Duration::from_secs(60), "long");
        canceller.join().expect("canceller thread");
        assert_eq!(outcome, RunOutcome::Cancelled);
    }
}
