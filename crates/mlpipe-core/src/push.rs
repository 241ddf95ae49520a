//! Pushing code and data to remotes after a full run.
//!
//! A pipeline that succeeded locally never fails because of a remote:
//! every push failure is downgraded to a warning in [`PushReport`].

use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{PipelineConfig, PushPolicy};
use crate::error::Result;
use crate::exec::{CommandRunner, Invocation};

/// Question asked under [`PushPolicy::Prompt`].
pub const PUSH_QUESTION: &str = "Push code and data to remotes? [y/N]";

/// Asks the operator a yes/no question.
pub trait Confirm: Send + Sync {
    fn confirm(&self, question: &str) -> Result<bool>;
}

/// Whether an answer counts as affirmative. Anything but `y`/`yes` is a no.
pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Reads the answer from a line of input.
pub struct LineConfirm<R, W> {
    input: std::sync::Mutex<R>,
    output: std::sync::Mutex<W>,
}

impl<R: BufRead, W: Write> LineConfirm<R, W> {
    pub fn new(input: R, output: W) -> Self {
        LineConfirm {
            input: std::sync::Mutex::new(input),
            output: std::sync::Mutex::new(output),
        }
    }
}

/// Prompt on stderr, answer from stdin.
pub fn stdin_confirm() -> LineConfirm<std::io::BufReader<std::io::Stdin>, std::io::Stderr> {
    LineConfirm::new(std::io::BufReader::new(std::io::stdin()), std::io::stderr())
}

impl<R: BufRead + Send, W: Write + Send> Confirm for LineConfirm<R, W> {
    fn confirm(&self, question: &str) -> Result<bool> {
        {
            let mut out = self.output.lock().unwrap_or_else(|e| e.into_inner());
            write!(out, "{question} ")?;
            out.flush()?;
        }
        let mut line = String::new();
        let read = self
            .input
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .read_line(&mut line)?;
        // EOF (closed stdin) counts as "no"
        Ok(read > 0 && is_affirmative(&line))
    }
}

/// Outcome of one push target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum PushStatus {
    Pushed { target: String },
    Failed { warning: String },
    Skipped,
}

impl PushStatus {
    pub fn is_pushed(&self) -> bool {
        matches!(self, PushStatus::Pushed { .. })
    }
}

/// What happened at the push step of a full run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReport {
    /// Whether pushing was attempted at all.
    pub attempted: bool,

    pub code: PushStatus,
    pub data: PushStatus,

    /// Commands the operator can run to push later.
    pub manual_commands: Vec<String>,
}

impl PushReport {
    /// Warnings from failed pushes.
    pub fn warnings(&self) -> Vec<&str> {
        [&self.code, &self.data]
            .into_iter()
            .filter_map(|s| match s {
                PushStatus::Failed { warning } => Some(warning.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Decides whether to push and performs the pushes.
pub struct PushConfirmer<'a> {
    config: &'a PipelineConfig,
    runner: &'a dyn CommandRunner,
    confirm: &'a dyn Confirm,
    envs: &'a [(String, String)],
}

impl<'a> PushConfirmer<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        runner: &'a dyn CommandRunner,
        confirm: &'a dyn Confirm,
        envs: &'a [(String, String)],
    ) -> Self {
        PushConfirmer {
            config,
            runner,
            confirm,
            envs,
        }
    }

    /// Commands for pushing by hand.
    pub fn manual_commands(&self) -> Vec<String> {
        vec![
            format!(
                "git push {} {}",
                self.config.git_remote, self.config.primary_branch
            ),
            "dvc push".to_string(),
        ]
    }

    /// Apply the push policy. Never returns an error for remote failures.
    pub async fn run(&self) -> Result<PushReport> {
        let go = match self.config.push_policy {
            PushPolicy::Always => true,
            PushPolicy::Never => false,
            PushPolicy::Prompt => self.ask(),
        };

        if !go {
            info!(policy = ?self.config.push_policy, "Skipping push");
            return Ok(PushReport {
                attempted: false,
                code: PushStatus::Skipped,
                data: PushStatus::Skipped,
                manual_commands: self.manual_commands(),
            });
        }

        let code = self.push_code().await?;
        let data = self.push_data().await?;
        let manual_commands = if code.is_pushed() && data.is_pushed() {
            Vec::new()
        } else {
            self.manual_commands()
        };

        Ok(PushReport {
            attempted: true,
            code,
            data,
            manual_commands,
        })
    }

    /// Ask the operator; an unreadable answer counts as "no".
    fn ask(&self) -> bool {
        match self.confirm.confirm(PUSH_QUESTION) {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "Could not read push answer; skipping push");
                false
            }
        }
    }

    /// Push to the primary branch, then the fallback branch.
    pub async fn push_code(&self) -> Result<PushStatus> {
        let remote = &self.config.git_remote;
        let mut last_error = String::new();
        for branch in [&self.config.primary_branch, &self.config.fallback_branch] {
            let invocation = Invocation::new(
                "git",
                ["push", remote.as_str(), branch.as_str()],
                &self.config.workdir,
            )
            .with_envs(self.envs);
            match self.runner.run(&invocation).await {
                Ok(output) if output.success() => {
                    info!(remote = %remote, branch = %branch, "Pushed code");
                    return Ok(PushStatus::Pushed {
                        target: format!("{remote}/{branch}"),
                    });
                }
                Ok(output) => last_error = output.combined().trim().to_string(),
                Err(e) => last_error = e.to_string(),
            }
            warn!(remote = %remote, branch = %branch, "git push failed");
        }

        let warning = format!(
            "could not push code to `{remote}` ({}); check the git remote configuration: {last_error}",
            [&self.config.primary_branch, &self.config.fallback_branch]
                .map(String::as_str)
                .join(", "),
        );
        warn!("{warning}");
        Ok(PushStatus::Failed { warning })
    }

    /// Push versioned data and model artifacts to the dvc remote.
    pub async fn push_data(&self) -> Result<PushStatus> {
        let invocation =
            Invocation::new("dvc", ["push"], &self.config.workdir).with_envs(self.envs);
        let detail = match self.runner.run(&invocation).await {
            Ok(output) if output.success() => {
                info!("Pushed data to dvc remote");
                return Ok(PushStatus::Pushed {
                    target: "dvc remote".to_string(),
                });
            }
            Ok(output) => output.combined().trim().to_string(),
            Err(e) => e.to_string(),
        };

        let warning =
            format!("could not push data; check `dvc remote list` and credentials: {detail}");
        warn!("{warning}");
        Ok(PushStatus::Failed { warning })
    }
}
