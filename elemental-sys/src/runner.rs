// SPDX-License-Identifier: GPL-3.0-only

//! External command execution

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::error::{Result, SysError};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs an external program and returns its combined stdout and stderr.
///
/// A non-zero exit status is an error carrying the captured output.
pub trait Runner: Send + Sync {
    fn run(&self, command: &str, args: &[&str]) -> Result<Vec<u8>>;
}

pub fn render(command: &str, args: &[&str]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, args.join(" "))
    }
}

/// Runs commands on the host, optionally killing them after a deadline
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    timeout: Option<Duration>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    fn wait_with_deadline(
        handle: &duct::Handle,
        timeout: Duration,
        rendered: &str,
    ) -> Result<std::process::Output> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(output) = handle.try_wait()? {
                return Ok(output.clone());
            }
            if Instant::now() >= deadline {
                handle.kill()?;
                error!(command = rendered, "command exceeded its deadline, killed");
                return Err(SysError::CommandTimeout {
                    command: rendered.to_string(),
                    seconds: timeout.as_secs(),
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Runner for CommandRunner {
    fn run(&self, command: &str, args: &[&str]) -> Result<Vec<u8>> {
        let rendered = render(command, args);
        debug!(command = %rendered, "running command");

        let handle = duct::cmd(command, args)
            .stderr_to_stdout()
            .stdout_capture()
            .unchecked()
            .start()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => SysError::CommandNotFound(command.to_string()),
                _ => SysError::Io(err),
            })?;

        let output = match self.timeout {
            Some(timeout) => Self::wait_with_deadline(&handle, timeout, &rendered)?,
            None => handle.wait()?.clone(),
        };

        if !output.status.success() {
            let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            error!(command = %rendered, status = %output.status, output = %text, "command failed");
            return Err(SysError::CommandFailed {
                command: rendered,
                output: text,
            });
        }

        Ok(output.stdout)
    }
}

/// Whether `command` resolves to an executable in `PATH`
pub fn command_exists(command: &str) -> bool {
    which::which(command).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_command_context() {
        let rendered = render("losetup", &["--show", "-f", "disk.img"]);
        assert_eq!(rendered, "losetup --show -f disk.img");
        assert_eq!(render("sync", &[]), "sync");
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let out = CommandRunner::new()
            .run("sh", &["-c", "echo out; echo err >&2"])
            .expect("command should succeed");
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("out"));
        assert!(text.contains("err"));
    }

    #[test]
    fn non_zero_exit_carries_output() {
        let err = CommandRunner::new()
            .run("sh", &["-c", "echo broken; exit 3"])
            .unwrap_err();
        match err {
            SysError::CommandFailed { command, output } => {
                assert!(command.starts_with("sh -c"));
                assert_eq!(output, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_binary_is_reported() {
        let err = CommandRunner::new()
            .run("definitely-not-a-real-binary-xyz", &[])
            .unwrap_err();
        assert!(matches!(err, SysError::CommandNotFound(_)));
    }

    #[test]
    fn deadline_kills_long_running_commands() {
        let runner = CommandRunner::with_timeout(Some(Duration::from_millis(200)));
        let started = Instant::now();
        let err = runner.run("sleep", &["5"]).unwrap_err();
        assert!(matches!(err, SysError::CommandTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
