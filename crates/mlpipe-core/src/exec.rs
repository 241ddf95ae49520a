//! External command execution.
//!
//! Every tool the orchestrator drives (stage scripts, `git`, `dvc`) goes
//! through [`CommandRunner`], so the driver can run against a scripted fake
//! instead of real subprocesses.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// How a child process's stdout/stderr are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Capture both streams into [`CommandOutput`].
    Capture,
    /// Pass both streams through to the operator's terminal.
    Inherit,
}

/// A single external command to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    /// Executable name or path.
    pub program: String,

    /// Arguments, not including the program.
    pub args: Vec<String>,

    /// Working directory.
    pub cwd: PathBuf,

    /// Extra environment variables layered over the inherited environment.
    pub envs: Vec<(String, String)>,

    pub output: OutputMode,
}

impl Invocation {
    /// Build an invocation from `program` and `args`, capturing output.
    pub fn new<I, S>(program: impl Into<String>, args: I, cwd: &Path) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: cwd.to_path_buf(),
            envs: Vec::new(),
            output: OutputMode::Capture,
        }
    }

    /// Build an invocation from an argv-style command (first element is the program).
    pub fn from_argv(argv: &[String], cwd: &Path) -> Result<Self> {
        let (program, args) = argv.split_first().ok_or_else(|| PipelineError::Spawn {
            command: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;
        Ok(Invocation::new(program.clone(), args.iter().cloned(), cwd))
    }

    /// Add environment overrides.
    pub fn with_envs(mut self, envs: &[(String, String)]) -> Self {
        self.envs.extend(envs.iter().cloned());
        self
    }

    /// Stream output to the terminal instead of capturing it.
    pub fn inherit_output(mut self) -> Self {
        self.output = OutputMode::Inherit;
        self
    }

    /// Program followed by arguments.
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv().join(" "))
    }
}

/// Result of running an [`Invocation`] to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,

    /// Captured stdout (empty in [`OutputMode::Inherit`]).
    pub stdout: String,

    /// Captured stderr (empty in [`OutputMode::Inherit`]).
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandOutput {
    /// A successful, silent exit.
    pub fn ok() -> Self {
        CommandOutput {
            exit_code: Some(0),
            ..Default::default()
        }
    }

    /// A nonzero exit with the given stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        CommandOutput {
            exit_code: Some(exit_code),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    /// Whether the process exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }

    /// Turn a nonzero exit into [`PipelineError::CommandFailed`].
    pub fn require_success(self, invocation: &Invocation) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(PipelineError::CommandFailed {
                command: invocation.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr,
            })
        }
    }
}

/// Capability to run external commands.
///
/// Implementations run the invocation to completion before returning;
/// there is no timeout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command and return its exit status and output.
    ///
    /// A process that starts and exits nonzero is `Ok`; only a failure to
    /// start at all is `Err(PipelineError::Spawn)`.
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;
}

/// Runs invocations as real child processes.
#[derive(Debug, Default, Clone)]
pub struct SubprocessRunner;

impl SubprocessRunner {
    pub fn new() -> Self {
        SubprocessRunner
    }
}

#[async_trait]
impl CommandRunner for SubprocessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let start = Instant::now();
        debug!(command = %invocation, cwd = %invocation.cwd.display(), "Spawning command");

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .envs(invocation.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());

        match invocation.output {
            OutputMode::Capture => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            OutputMode::Inherit => {
                command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
        }

        let spawn_err = |source| PipelineError::Spawn {
            command: invocation.to_string(),
            source,
        };
        let child = command.spawn().map_err(spawn_err)?;
        let output = child.wait_with_output().await.map_err(spawn_err)?;

        let duration_ms = start.elapsed().as_millis() as u64;
        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms,
        };
        debug!(
            command = %invocation,
            exit_code = ?result.exit_code,
            duration_ms,
            "Command finished"
        );
        Ok(result)
    }
}
