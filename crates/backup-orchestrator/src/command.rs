//! Supervised child processes.
//!
//! Every external program the orchestrator runs goes through [`supervise`], which enforces a
//! deadline and observes cancellation by killing the child instead of waiting on it forever.

use core::time::Duration;
use std::{
    io::{self, Read, Write},
    os::unix::process::CommandExt,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::Instant,
};

use thiserror::Error;
use tracing::warn;

use crate::Cancellation;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The collected result of a finished child process.
#[derive(Debug)]
pub struct CommandOutput {
    /// The program that was run.
    pub program: String,

    /// The exit status.
    pub status: ExitStatus,

    /// The captured stdout, empty when stdout was streamed into a sink.
    pub stdout: Vec<u8>,

    /// The captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns an error if the process exited unsuccessfully.
    pub fn ensure_success(self) -> Result<Self, CommandError> {
        if self.status.success() {
            return Ok(self);
        }

        Err(CommandError::Failed {
            program: self.program,
            status: self.status,
            stderr: self.stderr,
        })
    }
}

/// Run a command to completion.
///
/// When `stdout_sink` is set the child's stdout is streamed into it, otherwise it is captured.
/// The child is killed if `deadline` passes or `cancellation` is raised.
///
/// The child is placed in its own process group, so an interrupt sent to the orchestrator's
/// group (Ctrl-C, a service manager stopping the unit) only stops it through `cancellation`.
pub fn supervise(
    command: &mut Command,
    stdout_sink: Option<&mut (dyn Write + Send)>,
    deadline: Option<Instant>,
    cancellation: &Cancellation,
) -> Result<CommandOutput, CommandError> {
    let program = command.get_program().to_string_lossy().into_owned();

    let mut child = command
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CommandError::Spawn(e, program.clone()))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    thread::scope(|scope| -> Result<CommandOutput, CommandError> {
        let stdout_reader = scope.spawn(move || -> io::Result<Vec<u8>> {
            let mut captured = Vec::new();
            let Some(mut stdout) = stdout else {
                return Ok(captured);
            };

            match stdout_sink {
                Some(sink) => {
                    io::copy(&mut stdout, sink)?;
                    sink.flush()?;
                }
                None => {
                    stdout.read_to_end(&mut captured)?;
                }
            }

            Ok(captured)
        });

        let stderr_reader = scope.spawn(move || {
            let mut captured = Vec::new();
            if let Some(mut stderr) = stderr {
                if let Err(error) = stderr.read_to_end(&mut captured) {
                    warn!("Could not read stderr: {error}");
                }
            }
            String::from_utf8_lossy(&captured).trim().to_string()
        });

        let status = wait(&mut child, &program, deadline, cancellation);

        let stdout = stdout_reader
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("stdout reader panicked")));
        let stderr = stderr_reader.join().unwrap_or_default();

        let status = status?;
        let stdout = stdout.map_err(|e| CommandError::Stream(e, program.clone()))?;

        Ok(CommandOutput {
            program,
            status,
            stdout,
            stderr,
        })
    })
}

fn wait(
    child: &mut Child,
    program: &str,
    deadline: Option<Instant>,
    cancellation: &Cancellation,
) -> Result<ExitStatus, CommandError> {
    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| CommandError::Wait(e, program.to_string()))?
        {
            return Ok(status);
        }

        if cancellation.is_cancelled() {
            kill(child, program);
            return Err(CommandError::Cancelled(program.to_string()));
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            kill(child, program);
            return Err(CommandError::Timeout(program.to_string()));
        }

        thread::sleep(POLL_INTERVAL);
    }
}

fn kill(child: &mut Child, program: &str) {
    if let Err(error) = child.kill() {
        warn!("Could not kill '{program}': {error}");
    }
    if let Err(error) = child.wait() {
        warn!("Could not reap '{program}': {error}");
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to run '{1}': {0}")]
    Spawn(#[source] io::Error, String),

    #[error("Failed to wait on '{1}': {0}")]
    Wait(#[source] io::Error, String),

    #[error("Failed to stream output of '{1}': {0}")]
    Stream(#[source] io::Error, String),

    #[error("'{0}' did not finish before its deadline")]
    Timeout(String),

    #[error("'{0}' was cancelled")]
    Cancelled(String),

    #[error("'{program}' exited with {status}:\n{stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}
