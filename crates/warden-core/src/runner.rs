//! Sequential command runner.
//!
//! `run_commands` owns the batch semantics (comment lines skipped, first
//! failure stops the batch, dry-run records every step as skipped). The
//! per-command work sits behind [`CommandExecutor`]; [`ShellExecutor`] runs
//! each command through `sh -c` with a timeout and an output cap.

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::guard::is_executable;

/// Per-stream bound on what a step keeps in its report.
pub const STEP_OUTPUT_LIMIT: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub timeout: Duration,
    pub output_buffer_bytes: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            output_buffer_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    TimedOut,
    Overflow,
    SpawnFailed,
    Skipped,
}

impl StepStatus {
    pub fn is_failure(self) -> bool {
        !matches!(self, StepStatus::Succeeded | StepStatus::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::TimedOut => "timed_out",
            StepStatus::Overflow => "overflow",
            StepStatus::SpawnFailed => "spawn_failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

/// What a single command did, before it is placed in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub command: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub ok: bool,
    pub steps: Vec<StepResult>,
}

impl RunReport {
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.status.is_failure())
    }

    /// Human-readable reason for a failed batch.
    pub fn error_message(&self) -> Option<String> {
        let step = self.failed_step()?;
        let detail = match step.status {
            StepStatus::Failed => format!("exited with code {}", step.exit_code.unwrap_or(-1)),
            StepStatus::TimedOut => "timed out".to_string(),
            StepStatus::Overflow => "exceeded the output buffer".to_string(),
            StepStatus::SpawnFailed => format!("could not start: {}", step.stderr.trim()),
            StepStatus::Succeeded | StepStatus::Skipped => return None,
        };
        Some(format!("step {} `{}` {detail}", step.index, step.command))
    }
}

pub trait CommandExecutor: Send + Sync {
    fn execute(&self, command: &str, limits: &RunLimits) -> CommandOutcome;
}

/// Run `commands` in order. Non-executable lines and, in dry-run mode,
/// every line are recorded as skipped.
pub fn run_commands(
    executor: &dyn CommandExecutor,
    commands: &[String],
    limits: &RunLimits,
    dry_run: bool,
) -> RunReport {
    let mut report = RunReport {
        ok: true,
        steps: Vec::with_capacity(commands.len()),
    };
    for (index, command) in commands.iter().enumerate() {
        if dry_run || !is_executable(command) {
            report.steps.push(StepResult {
                index,
                command: command.clone(),
                status: StepStatus::Skipped,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 0,
            });
            continue;
        }

        let started = Instant::now();
        let outcome = executor.execute(command.trim(), limits);
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(index, command = %command, status = outcome.status.as_str(), duration_ms, "step finished");

        let failed = outcome.status.is_failure();
        report.steps.push(StepResult {
            index,
            command: command.clone(),
            status: outcome.status,
            exit_code: outcome.exit_code,
            stdout: truncate_tail(&outcome.stdout, STEP_OUTPUT_LIMIT),
            stderr: truncate_tail(&outcome.stderr, STEP_OUTPUT_LIMIT),
            duration_ms,
        });
        if failed {
            report.ok = false;
            break;
        }
    }
    report
}

/// Keep at most `max` bytes from the end of `s`, on a char boundary.
pub fn truncate_tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

// ---------------------------------------------------------------------------
// ShellExecutor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    pub cwd: Option<PathBuf>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

struct Captured {
    tail: Vec<u8>,
    total: usize,
}

/// Drain a pipe to EOF, keeping only the last `limit` bytes.
fn capture<R: Read>(reader: Option<R>, limit: usize) -> Captured {
    let mut captured = Captured {
        tail: Vec::new(),
        total: 0,
    };
    let Some(mut r) = reader else {
        return captured;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match r.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                captured.total += n;
                captured.tail.extend_from_slice(&chunk[..n]);
                if captured.tail.len() > limit {
                    let excess = captured.tail.len() - limit;
                    captured.tail.drain(..excess);
                }
            }
        }
    }
    captured
}

impl CommandExecutor for ShellExecutor {
    fn execute(&self, command: &str, limits: &RunLimits) -> CommandOutcome {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return CommandOutcome {
                    status: StepStatus::SpawnFailed,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("failed to spawn: {e}"),
                }
            }
        };
        // The child leads its own group, so the group id is its pid.
        let pgid = child.id();

        // Dedicated readers keep the pipes drained while we wait.
        let limit = limits.output_buffer_bytes;
        let stdout_handle = child.stdout.take();
        let stderr_handle = child.stderr.take();
        let stdout_thread = std::thread::spawn(move || capture(stdout_handle, limit));
        let stderr_thread = std::thread::spawn(move || capture(stderr_handle, limit));

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(child.wait());
        });

        let wait_result = match rx.recv_timeout(limits.timeout) {
            Ok(result) => Some(result),
            Err(_) => {
                kill_group(pgid);
                None
            }
        };

        let empty = || Captured {
            tail: Vec::new(),
            total: 0,
        };
        let out = stdout_thread.join().unwrap_or_else(|_| empty());
        let err = stderr_thread.join().unwrap_or_else(|_| empty());
        let stdout = String::from_utf8_lossy(&out.tail).into_owned();
        let mut stderr = String::from_utf8_lossy(&err.tail).into_owned();

        let Some(wait_result) = wait_result else {
            return CommandOutcome {
                status: StepStatus::TimedOut,
                exit_code: None,
                stdout,
                stderr: format!("{stderr}\ntimed out after {}s", limits.timeout.as_secs())
                    .trim()
                    .to_string(),
            };
        };
        let exit = match wait_result {
            Ok(s) => s,
            Err(e) => {
                stderr.push_str(&format!("\nwait failed: {e}"));
                return CommandOutcome {
                    status: StepStatus::Failed,
                    exit_code: None,
                    stdout,
                    stderr,
                };
            }
        };

        let status = if out.total + err.total > limit {
            StepStatus::Overflow
        } else if exit.success() {
            StepStatus::Succeeded
        } else {
            StepStatus::Failed
        };
        CommandOutcome {
            status,
            exit_code: exit.code(),
            stdout,
            stderr,
        }
    }
}

/// SIGKILL the whole process group so grandchildren holding the output
/// pipes die with the shell. Best-effort.
fn kill_group(pgid: u32) {
    let _ = Command::new("kill")
        .arg("-9")
        .arg("--")
        .arg(format!("-{pgid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

// ---------------------------------------------------------------------------
// Scripted executor for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    /// Fails any command containing one of `failing`; records every call.
    #[derive(Default)]
    pub struct ScriptedExecutor {
        pub failing: Mutex<Vec<String>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        pub fn failing_on(patterns: &[&str]) -> Self {
            Self {
                failing: Mutex::new(patterns.iter().map(|s| s.to_string()).collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandExecutor for ScriptedExecutor {
        fn execute(&self, command: &str, _limits: &RunLimits) -> CommandOutcome {
            self.calls.lock().unwrap().push(command.to_string());
            let fail = self
                .failing
                .lock()
                .unwrap()
                .iter()
                .any(|p| command.contains(p.as_str()));
            CommandOutcome {
                status: if fail {
                    StepStatus::Failed
                } else {
                    StepStatus::Succeeded
                },
                exit_code: Some(if fail { 1 } else { 0 }),
                stdout: format!("ran {command}"),
                stderr: String::new(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::fake::ScriptedExecutor;
    use super::*;

    fn cmds(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn first_failure_stops_batch() {
        let exec = ScriptedExecutor::failing_on(&["two"]);
        let report = run_commands(
            &exec,
            &cmds(&["echo one", "# note", "echo two", "echo three"]),
            &RunLimits::default(),
            false,
        );
        assert!(!report.ok);
        assert_eq!(report.steps.len(), 3);
        assert_eq!(report.steps[1].status, StepStatus::Skipped);
        assert_eq!(report.steps[2].status, StepStatus::Failed);
        assert_eq!(exec.calls(), vec!["echo one", "echo two"]);
        assert!(report.error_message().unwrap().contains("step 2"));
    }

    #[test]
    fn dry_run_never_executes() {
        let exec = ScriptedExecutor::default();
        let report = run_commands(&exec, &cmds(&["echo a", "echo b"]), &RunLimits::default(), true);
        assert!(report.ok);
        assert!(report.steps.iter().all(|s| s.status == StepStatus::Skipped));
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn truncate_keeps_tail_on_char_boundary() {
        assert_eq!(truncate_tail("abcdef", 3), "def");
        assert_eq!(truncate_tail("abc", 10), "abc");
        let s = "xé"; // 'é' is two bytes
        assert_eq!(truncate_tail(s, 1), "");
        assert_eq!(truncate_tail(s, 2), "é");
    }

    #[test]
    fn shell_success_and_exit_code() {
        let exec = ShellExecutor::new();
        let ok = exec.execute("echo hello", &RunLimits::default());
        assert_eq!(ok.status, StepStatus::Succeeded);
        assert_eq!(ok.stdout.trim(), "hello");

        let bad = exec.execute("echo oops >&2; exit 3", &RunLimits::default());
        assert_eq!(bad.status, StepStatus::Failed);
        assert_eq!(bad.exit_code, Some(3));
        assert_eq!(bad.stderr.trim(), "oops");
    }

    #[test]
    fn shell_timeout_kills_command() {
        let exec = ShellExecutor::new();
        let limits = RunLimits {
            timeout: Duration::from_millis(200),
            ..RunLimits::default()
        };
        let started = Instant::now();
        let outcome = exec.execute("exec sleep 5", &limits);
        assert_eq!(outcome.status, StepStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn shell_timeout_kills_compound_command() {
        let exec = ShellExecutor::new();
        let limits = RunLimits {
            timeout: Duration::from_millis(200),
            ..RunLimits::default()
        };
        let started = Instant::now();
        let outcome = exec.execute("sleep 3; echo hi", &limits);
        assert_eq!(outcome.status, StepStatus::TimedOut);
        assert!(!outcome.stdout.contains("hi"));
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "timeout not enforced: {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn shell_timeout_kills_pipeline() {
        let exec = ShellExecutor::new();
        let limits = RunLimits {
            timeout: Duration::from_millis(200),
            ..RunLimits::default()
        };
        let started = Instant::now();
        let outcome = exec.execute("sleep 3 | cat", &limits);
        assert_eq!(outcome.status, StepStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn shell_output_overflow() {
        let exec = ShellExecutor::new();
        let limits = RunLimits {
            output_buffer_bytes: 1024,
            ..RunLimits::default()
        };
        let outcome = exec.execute("head -c 5000 /dev/zero | tr '\\0' 'x'", &limits);
        assert_eq!(outcome.status, StepStatus::Overflow);
        assert!(outcome.stdout.len() <= 1024);
    }
}
