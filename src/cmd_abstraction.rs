//! Command execution abstraction for testability.
//!
//! Every collaborator (apt, ufw, sshd, nginx, certbot, systemctl) is driven
//! through [`CommandExecutor`], so unit tests can pin the exact command lines
//! without touching the host.

use anyhow::{Context, Result};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::ProvisionError;

#[cfg(test)]
use mockall::automock;

/// Timeout for local, fast commands (config checks, service reloads).
pub const LOCAL_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for commands that reach the network (package index, ACME).
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(900);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Output from command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// The exit code, if available
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Successful output with the given stdout (handy in tests).
    pub fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            stderr: String::new(),
            success: true,
            code: Some(0),
        }
    }

    /// Failed output with the given stderr and exit code.
    pub fn failed(stderr: &str, code: i32) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.to_string(),
            success: false,
            code: Some(code),
        }
    }

    /// Best human-readable description of a failure.
    pub fn diagnostic(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        match self.code {
            Some(code) => format!("exit {}: {}", code, text),
            None => format!("killed: {}", text),
        }
    }
}

/// Trait for command execution, allowing dependency injection for testing.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    /// Execute `cmd` with `args`, killing it once `timeout` elapses.
    ///
    /// A non-zero exit status is reported through `CommandOutput::success`,
    /// not as an error. Spawn failures and timeouts are errors.
    fn execute(&self, cmd: &str, args: &[String], timeout: Duration) -> Result<CommandOutput>;
}

/// Real implementation of CommandExecutor that runs actual system commands.
#[derive(Debug, Clone, Default)]
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self
    }

    fn spawn(cmd: &str, args: &[String]) -> Result<Child> {
        Command::new(cmd)
            .args(args)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute {}", cmd))
    }

    /// Drain both pipes on helper threads and poll for exit until `timeout`.
    fn wait(cmd: &str, mut child: Child, timeout: Duration) -> Result<CommandOutput> {
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() >= timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProvisionError::Timeout {
                    what: cmd.to_string(),
                    secs: timeout.as_secs(),
                }
                .into());
            }
            thread::sleep(POLL_INTERVAL);
        };

        let collect = |handle: Option<thread::JoinHandle<String>>| {
            handle.and_then(|h| h.join().ok()).unwrap_or_default()
        };

        Ok(CommandOutput {
            stdout: collect(stdout),
            stderr: collect(stderr),
            success: status.success(),
            code: status.code(),
        })
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).to_string()
    })
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, cmd: &str, args: &[String], timeout: Duration) -> Result<CommandOutput> {
        let child = Self::spawn(cmd, args)?;
        Self::wait(cmd, child, timeout)
    }
}

/// Helper function to convert a slice of &str to Vec<String>.
///
/// mockall has issues with lifetimes in `&[&str]`, so the trait takes
/// `&[String]`.
pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Run a command and fail unless it exits 0.
pub fn run_checked(
    executor: &dyn CommandExecutor,
    cmd: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput> {
    let output = executor.execute(cmd, &args_to_strings(args), timeout)?;
    if !output.success {
        return Err(ProvisionError::Command(format!(
            "{} {} ({})",
            cmd,
            args.join(" "),
            output.diagnostic()
        ))
        .into());
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_to_strings() {
        let args = args_to_strings(&["-t", "-f", "/etc/ssh/sshd_config"]);
        assert_eq!(args, vec!["-t", "-f", "/etc/ssh/sshd_config"]);
    }

    #[test]
    fn test_command_output_default() {
        let output = CommandOutput::default();
        assert!(output.stdout.is_empty());
        assert!(!output.success);
        assert!(output.code.is_none());
    }

    #[test]
    fn test_diagnostic_prefers_stderr() {
        let mut output = CommandOutput::failed("bad directive", 255);
        output.stdout = "noise".to_string();
        assert_eq!(output.diagnostic(), "exit 255: bad directive");
    }

    #[test]
    fn test_real_executor_echo() {
        let executor = RealCommandExecutor::new();
        let output = executor
            .execute("echo", &args_to_strings(&["-n", "hello"]), LOCAL_TIMEOUT)
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "hello");
    }

    #[test]
    fn test_real_executor_nonzero_exit_is_not_an_error() {
        let executor = RealCommandExecutor::new();
        let output = executor
            .execute("ls", &args_to_strings(&["--invalid-flag"]), LOCAL_TIMEOUT)
            .unwrap();
        assert!(!output.success);
    }

    #[test]
    fn test_real_executor_has_no_stdin() {
        // A command reading stdin sees end-of-file instead of hanging.
        let executor = RealCommandExecutor::new();
        let output = executor.execute("cat", &[], LOCAL_TIMEOUT).unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "");
    }

    #[test]
    fn test_real_executor_timeout_kills_child() {
        let executor = RealCommandExecutor::new();
        let err = executor
            .execute(
                "sleep",
                &args_to_strings(&["5"]),
                Duration::from_millis(200),
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::Timeout { .. })
        ));
    }

    #[test]
    fn test_run_checked_reports_failure() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|cmd, args, _| cmd == "systemctl" && args == ["reload", "nginx"])
            .times(1)
            .returning(|_, _, _| Ok(CommandOutput::failed("Job failed", 1)));

        let err = run_checked(&mock, "systemctl", &["reload", "nginx"], LOCAL_TIMEOUT)
            .unwrap_err();
        assert!(err.to_string().contains("systemctl reload nginx"));
        assert!(err.to_string().contains("Job failed"));
    }
}
