use crate::entities::LocationUrl;
use crate::error::{BackupError, Result};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

#[cfg(test)]
use mockall::automock;


/// Interval between child polls while supervising a transfer pipeline.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Create subprocess arguments for a shell command to be executed at the
/// location addressed by `url`.
///
/// A local command is wrapped into `bash -c`; a remote command is wrapped
/// into an ssh invocation with keepalive options, so the remote login shell
/// re-interprets the command line. Either way the command stays a single
/// shell line, which callers rely on for pipes, conditionals and globs.
pub fn build_args(cmd: &str, url: &LocationUrl) -> Vec<String> {
    match url.ssh_target() {
        None => vec!["bash".into(), "-c".into(), cmd.into()],
        Some(target) => {
            let mut args: Vec<String> = vec![
                "ssh".into(),
                "-o".into(),
                "ServerAliveInterval=5".into(),
                "-o".into(),
                "ServerAliveCountMax=3".into(),
            ];

            if let Some(port) = url.port {
                args.push("-p".into());
                args.push(port.to_string());
            }

            args.push(target);
            args.push(cmd.into());
            args
        }
    }
}

/// Sole abstraction for executing side effects on a location.
#[cfg_attr(test, automock)]
pub trait Shell {
    /// Run a command to completion, returning its captured output.
    ///
    /// A non-zero exit maps to [`BackupError::CommandFailed`] carrying the
    /// exit code and captured stderr.
    fn exec_check_output(&self, cmd: &str, url: &LocationUrl) -> Result<Vec<u8>>;

    /// Run a command to completion and return its raw exit code.
    fn exec_call(&self, cmd: &str, url: &LocationUrl) -> Result<i32>;

    /// Run a command with `input` piped to its stdin.
    fn exec_write(&self, cmd: &str, url: &LocationUrl, input: &[u8]) -> Result<()>;

    /// Probe whether a command exists at a location.
    fn exists(&self, command: &str, url: &LocationUrl) -> bool;

    /// Run a send|receive pipeline, wiring the sender's stdout into the
    /// receiver's stdin, optionally through a local `pv` progress meter.
    ///
    /// Both children are supervised; as soon as either exits non-zero the
    /// other is killed and the run fails [`BackupError::TransferFailed`].
    fn transfer(
        &self,
        send_cmd: &str,
        send_url: &LocationUrl,
        receive_cmd: &str,
        receive_url: &LocationUrl,
        progress: bool,
    ) -> Result<()>;
}

/// [`Shell`] implementation executing real processes.
#[derive(Default)]
pub struct SystemShell {}

impl SystemShell {
    fn command(cmd: &str, url: &LocationUrl) -> Command {
        let args = build_args(cmd, url);
        log::debug!("executing {:?}", args);

        let mut command = Command::new(&args[0]);
        command.args(&args[1..]);
        command
    }
}

impl Shell for SystemShell {
    fn exec_check_output(&self, cmd: &str, url: &LocationUrl) -> Result<Vec<u8>> {
        let output = Self::command(cmd, url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        check_output(output.status.code(), output.stdout, &output.stderr)
    }

    fn exec_call(&self, cmd: &str, url: &LocationUrl) -> Result<i32> {
        let status = Self::command(cmd, url)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;

        Ok(status.code().unwrap_or(-1))
    }

    fn exec_write(&self, cmd: &str, url: &LocationUrl, input: &[u8]) -> Result<()> {
        let mut child = Self::command(cmd, url)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        match child.stdin.take() {
            Some(mut stdin) => {
                use std::io::Write;
                stdin.write_all(input)?;
            }
            None => {
                return Err(BackupError::CommandFailed {
                    code: -1,
                    stderr: "could not open stdin of child process".into(),
                })
            }
        }

        let output = child.wait_with_output()?;
        check_output(output.status.code(), output.stdout, &output.stderr).map(|_| ())
    }

    fn exists(&self, command: &str, url: &LocationUrl) -> bool {
        matches!(self.exec_call(&format!("type {}", command), url), Ok(0))
    }

    fn transfer(
        &self,
        send_cmd: &str,
        send_url: &LocationUrl,
        receive_cmd: &str,
        receive_url: &LocationUrl,
        progress: bool,
    ) -> Result<()> {
        let mut send_process = Self::command(send_cmd, send_url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let send_stdout = send_process.stdout.take().ok_or_else(spawn_error)?;

        // pv runs on the supervising host; its stderr stays on the terminal
        // so the meter is visible.
        let mut pv_process = None;
        let receive_stdin = match progress {
            true => {
                let mut pv = Command::new("pv")
                    .stdin(send_stdout)
                    .stdout(Stdio::piped())
                    .spawn()?;
                let pv_stdout = pv.stdout.take().ok_or_else(spawn_error)?;
                pv_process = Some(pv);
                Stdio::from(pv_stdout)
            }
            false => Stdio::from(send_stdout),
        };

        let mut receive_process = Self::command(receive_cmd, receive_url)
            .stdin(receive_stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        supervise(&mut send_process, &mut receive_process)?;

        let send_status = send_process.wait()?;
        let receive_status = receive_process.wait()?;

        if let Some(pv) = &mut pv_process {
            let _ = pv.wait();
        }

        let send_code = send_status.code().unwrap_or(-1);
        let receive_code = receive_status.code().unwrap_or(-1);

        if send_code != 0 || receive_code != 0 {
            log_child_stderr("send", &mut send_process);
            log_child_stderr("receive", &mut receive_process);

            return Err(BackupError::TransferFailed {
                send: send_code,
                receive: receive_code,
            });
        }

        Ok(())
    }
}

/// Poll both pipeline children until completion, killing the survivor as
/// soon as either exits non-zero.
fn supervise(send_process: &mut Child, receive_process: &mut Child) -> Result<()> {
    loop {
        let send_status = send_process.try_wait()?;
        let receive_status = receive_process.try_wait()?;

        match (send_status, receive_status) {
            (Some(_), Some(_)) => return Ok(()),
            (Some(status), None) if status.code() != Some(0) => {
                let _ = receive_process.kill();
                return Ok(());
            }
            (None, Some(status)) if status.code() != Some(0) => {
                let _ = send_process.kill();
                return Ok(());
            }
            _ => {}
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

fn log_child_stderr(name: &str, child: &mut Child) {
    if let Some(stderr) = &mut child.stderr {
        let mut buffer = String::new();
        if stderr.read_to_string(&mut buffer).is_ok() {
            let buffer = buffer.trim();
            if !buffer.is_empty() {
                log::warn!("{}: {}", name, buffer);
            }
        }
    }
}

fn spawn_error() -> BackupError {
    BackupError::CommandFailed {
        code: -1,
        stderr: "could not connect pipeline process streams".into(),
    }
}

fn check_output(code: Option<i32>, stdout: Vec<u8>, stderr: &[u8]) -> Result<Vec<u8>> {
    match code {
        Some(0) => Ok(stdout),
        Some(code) => Err(BackupError::CommandFailed {
            code,
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }),
        None => Err(BackupError::CommandFailed {
            code: -1,
            stderr: "command was terminated by signal".into(),
        }),
    }
}
