use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::posix;
use crate::process::ExitStatus;

/// How the exit codes of a pipeline's stages combine into the pipeline's code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExitPolicy {
    /// The code of the last stage, like a plain shell pipeline.
    #[default]
    LastStage,
    /// The code of the rightmost stage that failed, like `set -o pipefail`.
    Pipefail,
}

/// How a stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// The process finished on its own.
    Exited(ExitStatus),
    /// The process was still running when the pipeline was cancelled.
    Terminated(ExitStatus),
}

impl StageStatus {
    pub fn exit_status(&self) -> ExitStatus {
        match *self {
            StageStatus::Exited(s) | StageStatus::Terminated(s) => s,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, StageStatus::Terminated(_))
    }
}

/// The result of one process of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    pub(crate) command: Command,
    pub(crate) status: StageStatus,
    pub(crate) stdout: Option<Vec<u8>>,
    pub(crate) stderr: Option<Vec<u8>>,
}

impl StageResult {
    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn status(&self) -> StageStatus {
        self.status
    }

    /// The exit code as a shell reports it: `128 + n` for death by signal `n`.
    pub fn code(&self) -> i32 {
        self.status.exit_status().shell_code()
    }

    /// Captured stdout, empty when stdout was not captured.
    pub fn stdout(&self) -> &[u8] {
        self.stdout.as_deref().unwrap_or_default()
    }

    /// Captured stderr, empty when stderr was not captured.
    pub fn stderr(&self) -> &[u8] {
        self.stderr.as_deref().unwrap_or_default()
    }

    /// Captured stdout, or `None` if it went elsewhere.
    pub fn captured_stdout(&self) -> Option<&[u8]> {
        self.stdout.as_deref()
    }

    /// Captured stderr, or `None` if it went elsewhere.
    pub fn captured_stderr(&self) -> Option<&[u8]> {
        self.stderr.as_deref()
    }

    // A non-last stage that died this way prevented the chain from completing.
    fn is_broken(&self) -> bool {
        match self.status.exit_status().signal() {
            Some(sig) => sig != posix::SIGPIPE,
            None => false,
        }
    }
}

/// The finished run of a command or pipeline.
///
/// Created once every process has exited and every output stream has been read to the
/// end. The primary `stdout` and `stderr` are those of the last stage; the output of the
/// others is available through [`stages`](Self::stages).
///
/// `Display` shows the captured stdout with surrounding whitespace trimmed, which is
/// what a shell's `$(...)` would produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    stages: Vec<StageResult>,
    policy: ExitPolicy,
    cancelled: bool,
    timed_out: bool,
}

impl Outcome {
    pub(crate) fn new(
        stages: Vec<StageResult>,
        policy: ExitPolicy,
        cancelled: bool,
        timed_out: bool,
    ) -> Outcome {
        Outcome {
            stages,
            policy,
            cancelled,
            timed_out,
        }
    }

    /// The exit code of the pipeline according to its [`ExitPolicy`].
    ///
    /// An empty pipeline has code 0.
    pub fn code(&self) -> i32 {
        match self.policy {
            ExitPolicy::LastStage => self.stages.last().map_or(0, StageResult::code),
            ExitPolicy::Pipefail => self
                .stages
                .iter()
                .rev()
                .map(StageResult::code)
                .find(|&c| c != 0)
                .unwrap_or(0),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code() == 0
    }

    pub fn exit_policy(&self) -> ExitPolicy {
        self.policy
    }

    /// Captured stdout of the last stage.
    pub fn stdout(&self) -> &[u8] {
        self.stages.last().map(StageResult::stdout).unwrap_or_default()
    }

    /// Captured stderr of the last stage.
    pub fn stderr(&self) -> &[u8] {
        self.stages.last().map(StageResult::stderr).unwrap_or_default()
    }

    /// Stdout of the last stage decoded as UTF-8, with invalid sequences replaced.
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(self.stdout()).into_owned()
    }

    /// Stderr of the last stage decoded as UTF-8, with invalid sequences replaced.
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(self.stderr()).into_owned()
    }

    /// Lines of [`stdout_str`](Self::stdout_str), without line terminators.
    pub fn lines(&self) -> Vec<String> {
        self.stdout_str().lines().map(str::to_owned).collect()
    }

    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    /// Index of the first stage that exited with a non-zero code.
    pub fn failed_stage(&self) -> Option<usize> {
        self.stages.iter().position(|s| s.code() != 0)
    }

    /// Index of the first non-last stage killed by a signal other than `SIGPIPE`.
    pub fn broken_stage(&self) -> Option<usize> {
        let (_, upstream) = self.stages.split_last()?;
        upstream.iter().position(StageResult::is_broken)
    }

    /// True if the run was cancelled, either explicitly or by its timeout.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled || self.timed_out
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// The pipeline as a shell-like command line.
    pub fn command_line(&self) -> String {
        let cmds: Vec<String> = self
            .stages
            .iter()
            .map(|s| s.command.to_cmdline_lossy())
            .collect();
        cmds.join(" | ")
    }

    /// Apply strict mode: turn cancellation, a broken pipeline or a non-zero code into
    /// the corresponding error.
    pub fn check(self) -> Result<Outcome> {
        let outcome = self.check_interrupted()?;
        if outcome.broken_stage().is_some() {
            return Err(Error::PipelineBroken(Box::new(outcome)));
        }
        if !outcome.is_success() {
            return Err(Error::CommandFailed(Box::new(outcome)));
        }
        Ok(outcome)
    }

    /// Relaxed mode: only cancellation and timeout are errors.
    pub(crate) fn check_interrupted(self) -> Result<Outcome> {
        if self.cancelled {
            return Err(Error::Cancelled(Box::new(self)));
        }
        if self.timed_out {
            return Err(Error::TimedOut(Box::new(self)));
        }
        Ok(self)
    }

    /// Write the captured stdout to `path`, replacing its contents.
    ///
    /// No locking is done, concurrent writers to the same path must coordinate.
    pub fn redirect_to(&self, path: impl AsRef<Path>) -> io::Result<()> {
        write_to(File::create(path)?, self.stdout())
    }

    /// Append the captured stdout to `path`, creating it if needed.
    pub fn append_to(&self, path: impl AsRef<Path>) -> io::Result<()> {
        write_to(open_append(path.as_ref())?, self.stdout())
    }

    /// Write the captured stderr to `path`, replacing its contents.
    pub fn redirect_stderr_to(&self, path: impl AsRef<Path>) -> io::Result<()> {
        write_to(File::create(path)?, self.stderr())
    }

    /// Append the captured stderr to `path`, creating it if needed.
    pub fn append_stderr_to(&self, path: impl AsRef<Path>) -> io::Result<()> {
        write_to(open_append(path.as_ref())?, self.stderr())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().append(true).create(true).open(path)
}

fn write_to(mut file: File, data: &[u8]) -> io::Result<()> {
    file.write_all(data)?;
    file.flush()
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stdout_str().trim())
    }
}
