//! Error taxonomy for pipeline orchestration.

use std::path::PathBuf;

use crate::stage::Stage;

/// Coarse classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing tool, inactive or unavailable environment, empty input set.
    Environment,
    /// An upstream artifact a stage depends on is absent.
    Precondition,
    /// A stage script or versioning command exited nonzero or could not start.
    ExternalCommand,
    /// The stage selector is outside the closed set.
    UnknownStage,
    /// Local I/O or serialization failure inside the orchestrator.
    Internal,
}

/// Fatal pipeline errors.
///
/// Non-fatal conditions (nothing to commit, remote push failures) never
/// surface here; they are reported as outcomes instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("required tool `{tool}` not found; install it or add it to PATH")]
    MissingTool { tool: String },

    #[error(
        "no active virtual environment and none found at {}; create it with `python -m venv {}`",
        path.display(),
        path.display()
    )]
    EnvironmentUnavailable { path: PathBuf },

    #[error("input directory {} is empty; place the raw data files there first", dir.display())]
    EmptyInput { dir: PathBuf },

    #[error("{stage} requires {} which does not exist; run `{upstream}` first", path.display())]
    Precondition {
        stage: Stage,
        path: PathBuf,
        upstream: Stage,
    },

    #[error("`{command}` exited with {}{}", exit_label(*exit_code), stderr_suffix(stderr))]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("commit for {stage} failed: {detail}")]
    CommitFailed { stage: Stage, detail: String },

    #[error("unknown stage `{0}`; expected one of: all, split, training, evaluate")]
    UnknownStage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::MissingTool { .. }
            | PipelineError::EnvironmentUnavailable { .. }
            | PipelineError::EmptyInput { .. } => ErrorKind::Environment,
            PipelineError::Precondition { .. } => ErrorKind::Precondition,
            PipelineError::CommandFailed { .. }
            | PipelineError::Spawn { .. }
            | PipelineError::CommitFailed { .. } => ErrorKind::ExternalCommand,
            PipelineError::UnknownStage(_) => ErrorKind::UnknownStage,
            PipelineError::Serialization(_) | PipelineError::Io(_) => ErrorKind::Internal,
        }
    }
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (terminated by signal)".to_string(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    // Keep the tail; stage scripts log a lot before the actual traceback.
    let lines: Vec<&str> = stderr.trim_end().lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let tail = &lines[lines.len().saturating_sub(5)..];
    format!(": {}", tail.join("\n"))
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
