//! Execution of external helpers (the solver, the geometry converter).
//!
//! The [`ProcessRunner`] trait is the seam between the orchestrator and the operating
//! system. [`TokioProcessRunner`] spawns the program with piped output and reads stdout and
//! stderr concurrently, line by line, forwarding every line to `tracing`. Reading both
//! pipes at the same time keeps a chatty child from blocking on a full pipe buffer.
use std::{io, process::Stdio};

use camino::Utf8Path;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};

use crate::align_errors::AlignError;

/// Exit status and captured output of a finished process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessOutput {
    /// Exit code, `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs a program to completion.
pub trait ProcessRunner {
    /// Run `program` with `args` inside `working_dir` and wait for it.
    ///
    /// Return
    /// ----------
    /// * The [`ProcessOutput`], whatever the exit status.
    /// * [`AlignError::SolverNotFound`] when the program cannot be located,
    ///   [`AlignError::SolverFailed`] when it cannot be started or waited for.
    fn run(
        &self,
        program: &str,
        args: &[String],
        working_dir: &Utf8Path,
    ) -> Result<ProcessOutput, AlignError>;
}

/// [`ProcessRunner`] backed by `tokio::process` on a private current-thread runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

impl ProcessRunner for TokioProcessRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        working_dir: &Utf8Path,
    ) -> Result<ProcessOutput, AlignError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| start_failure(program, e))?;
        runtime.block_on(run_and_drain(program, args, working_dir))
    }
}

fn start_failure(program: &str, e: io::Error) -> AlignError {
    tracing::error!(program, error = %e, "cannot run external program");
    AlignError::SolverFailed { status: None }
}

async fn run_and_drain(
    program: &str,
    args: &[String],
    working_dir: &Utf8Path,
) -> Result<ProcessOutput, AlignError> {
    tracing::info!(program, ?args, %working_dir, "starting external program");
    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => AlignError::SolverNotFound(program.to_string()),
            _ => start_failure(program, e),
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (stdout, stderr, status) = tokio::join!(
        drain(stdout, program, false),
        drain(stderr, program, true),
        child.wait()
    );
    let status = status.map_err(|e| start_failure(program, e))?;

    let output = ProcessOutput {
        status: status.code(),
        stdout: stdout.map_err(|e| start_failure(program, e))?,
        stderr: stderr.map_err(|e| start_failure(program, e))?,
    };
    tracing::info!(program, status = ?output.status, "external program finished");
    Ok(output)
}

/// Forward every line of a pipe to the log; stderr lines are warnings.
async fn drain(
    pipe: Option<impl AsyncRead + Unpin>,
    program: &str,
    is_stderr: bool,
) -> io::Result<Vec<String>> {
    let mut collected = Vec::new();
    let Some(pipe) = pipe else {
        return Ok(collected);
    };
    let mut lines = BufReader::new(pipe).lines();
    while let Some(line) = lines.next_line().await? {
        if is_stderr {
            tracing::warn!(solver = program, stream = "stderr", "{line}");
        } else {
            tracing::info!(solver = program, stream = "stdout", "{line}");
        }
        collected.push(line);
    }
    Ok(collected)
}
