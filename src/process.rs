//! Blocking subprocess execution with optional time bounds.
//!
//! [`Cmd`] wraps `std::process::Command` with the pieces every external
//! tool invocation here needs: a readable command line for logs and errors,
//! captured output folded into [`ComposeError::Subprocess`], and a wait that
//! kills the child once a timeout expires.

use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{ComposeError, Result};

/// Captured result of a successful command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub stdout: String,
}

/// How the child's stdio is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Capture,
    Inherit,
}

/// Builder for an external command.
#[derive(Debug)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    timeout: Option<Duration>,
    mode: OutputMode,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            timeout: None,
            mode: OutputMode::Capture,
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Kill the child if it has not exited after `timeout`.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Let the child write straight to our terminal instead of capturing.
    pub fn inherit_output(mut self) -> Self {
        self.mode = OutputMode::Inherit;
        self
    }

    /// Prefix prepended to the captured output on failure.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Program and arguments, shell-quoted.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| shell_quote(&part.to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run to completion; a non-zero exit becomes [`ComposeError::Subprocess`].
    pub fn run(self) -> Result<CmdOutput> {
        let cmdline = self.display();
        info!(command = %cmdline, "running");

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        match self.mode {
            OutputMode::Capture => {
                command
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
            OutputMode::Inherit => {
                command
                    .stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
        }

        let mut child = command.spawn().map_err(|e| ComposeError::Subprocess {
            command: cmdline.clone(),
            status: "failed to start".into(),
            output: e.to_string(),
        })?;

        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let status = wait_with_timeout(child, self.timeout, &cmdline)?;
        let stdout = stdout.map(join_reader).unwrap_or_default();
        let stderr = stderr.map(join_reader).unwrap_or_default();
        debug!(command = %cmdline, %status, "finished");

        if !status.success() {
            let mut output = String::new();
            if let Some(msg) = &self.error_msg {
                output.push_str(msg);
                output.push('\n');
            }
            output.push_str(stdout.trim());
            if !stdout.trim().is_empty() && !stderr.trim().is_empty() {
                output.push('\n');
            }
            output.push_str(stderr.trim());
            return Err(ComposeError::exit_status(cmdline, status, output));
        }

        Ok(CmdOutput { stdout })
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> Option<thread::JoinHandle<String>>
where
    R: Read + Send + 'static,
{
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_reader(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

/// Wait for `child`, killing and reaping it if `timeout` expires first.
///
/// Without a timeout this is a plain blocking wait.
pub fn wait_with_timeout(
    mut child: Child,
    timeout: Option<Duration>,
    what: &str,
) -> Result<ExitStatus> {
    let Some(timeout) = timeout else {
        return child.wait().map_err(|e| ComposeError::Subprocess {
            command: what.to_string(),
            status: "wait failed".into(),
            output: e.to_string(),
        });
    };

    let pid = child.id();
    let (tx, rx) = mpsc::channel();
    let (kill_tx, kill_rx) = mpsc::channel::<()>();
    let waiter = thread::spawn(move || {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let _ = tx.send(Ok(status));
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            }
            if kill_rx.recv_timeout(Duration::from_millis(100)).is_ok() {
                let _ = child.kill();
                let _ = child.wait();
                return;
            }
        }
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(status)) => {
            let _ = waiter.join();
            Ok(status)
        }
        Ok(Err(e)) => {
            let _ = waiter.join();
            Err(ComposeError::Subprocess {
                command: what.to_string(),
                status: "wait failed".into(),
                output: e.to_string(),
            })
        }
        Err(_) => {
            let _ = kill_tx.send(());
            let _ = waiter.join();
            tracing::warn!(pid, command = %what, "killed after timeout");
            Err(ComposeError::BuildTimeout {
                target: what.to_string(),
                timeout,
            })
        }
    }
}

/// Quote `s` for a POSIX shell.
///
/// Words made only of safe characters are returned unchanged; anything else
/// is wrapped in single quotes with embedded quotes written as `'\''`.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '-' | '_' | '.' | '/' | '=' | ':' | ',' | '+' | '@')
        });
    if safe {
        return s.to_string();
    }
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for c in s.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("lorax"), "lorax");
        assert_eq!(
            shell_quote("--add-template=/root/lorax.tmpl"),
            "--add-template=/root/lorax.tmpl"
        );
        assert_eq!(shell_quote("Project Atomic"), "'Project Atomic'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_run_captures_stdout() {
        let out = Cmd::new("sh").args(["-c", "echo hello"]).run().unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_nonzero_exit_is_subprocess_error() {
        let err = Cmd::new("sh")
            .args(["-c", "echo broken >&2; exit 3"])
            .run()
            .unwrap_err();
        match err {
            ComposeError::Subprocess { output, .. } => assert!(output.contains("broken")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_program_is_subprocess_error() {
        let err = Cmd::new("definitely_not_a_real_command_12345")
            .run()
            .unwrap_err();
        assert!(matches!(err, ComposeError::Subprocess { .. }));
    }

    #[test]
    fn test_timeout_kills_child() {
        let err = Cmd::new("sleep")
            .arg("30")
            .timeout(Some(Duration::from_millis(200)))
            .run()
            .unwrap_err();
        assert!(matches!(err, ComposeError::BuildTimeout { .. }));
    }
}
