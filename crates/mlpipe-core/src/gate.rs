//! Commit gate: stage pipeline state in git and commit it per stage.
//!
//! Re-running a stage whose outputs did not change must not fail the run, so
//! "nothing to commit" is an outcome here, not an error.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::exec::{CommandOutput, CommandRunner, Invocation};
use crate::stage::Stage;

/// Non-failing outcomes of the commit gate.
///
/// A failed commit is `Err(PipelineError::CommitFailed)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CommitOutcome {
    /// A new commit was created.
    Committed { message: String },

    /// The tree had no changes to record.
    NoOp,
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed { .. })
    }
}

/// Git messages that mean the commit had nothing to record.
const NOTHING_TO_COMMIT: [&str; 3] = [
    "nothing to commit",
    "no changes added to commit",
    "nothing added to commit",
];

/// Stages and commits pipeline state after a stage.
pub struct CommitGate<'a> {
    config: &'a PipelineConfig,
    runner: &'a dyn CommandRunner,
    envs: &'a [(String, String)],
}

impl<'a> CommitGate<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        runner: &'a dyn CommandRunner,
        envs: &'a [(String, String)],
    ) -> Self {
        CommitGate {
            config,
            runner,
            envs,
        }
    }

    fn git<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::new("git", args, &self.config.workdir).with_envs(self.envs)
    }

    /// `git add` one path; any failure is fatal for `stage`.
    pub async fn stage_path(&self, stage: Stage, path: &Path) -> Result<()> {
        let invocation = self.git(["add".to_string(), path.to_string_lossy().into_owned()]);
        let output = self.runner.run(&invocation).await?;
        if !output.success() {
            return Err(PipelineError::CommitFailed {
                stage,
                detail: format!("`{invocation}` failed: {}", output.combined().trim()),
            });
        }
        Ok(())
    }

    /// Stage the lock file, parameter file and source tree, then commit.
    ///
    /// Paths that do not exist are skipped. Returns `NoOp` when neither the
    /// index nor the working tree differs from `HEAD`, or when git itself
    /// reports there is nothing to commit.
    pub async fn commit_stage(&self, stage: Stage) -> Result<CommitOutcome> {
        for path in self.config.commit_paths() {
            if !self.config.resolve(path).exists() {
                debug!(stage = %stage, path = %path.display(), "Skipping missing path");
                continue;
            }
            self.stage_path(stage, path).await?;
        }

        if !self.has_changes().await? {
            info!(stage = %stage, "Nothing to commit");
            return Ok(CommitOutcome::NoOp);
        }

        let message = stage.commit_message().to_string();
        let invocation = self.git(["commit", "-m", message.as_str()]);
        let output = self.runner.run(&invocation).await?;
        classify_commit(stage, message, &output)
    }

    /// Whether the index or the working tree differs from `HEAD`.
    ///
    /// `git diff --quiet` exits 1 when there are differences; any other
    /// nonzero status is an error.
    async fn has_changes(&self) -> Result<bool> {
        for args in [vec!["diff", "--quiet"], vec!["diff", "--cached", "--quiet"]] {
            let invocation = self.git(args);
            let output = self.runner.run(&invocation).await?;
            match output.exit_code {
                Some(0) => {}
                Some(1) => return Ok(true),
                _ => {
                    // Unborn HEAD and similar states: let `git commit` decide.
                    warn!(command = %invocation, exit_code = ?output.exit_code, "Could not diff working tree");
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

fn classify_commit(stage: Stage, message: String, output: &CommandOutput) -> Result<CommitOutcome> {
    if output.success() {
        info!(stage = %stage, message = %message, "Committed stage");
        return Ok(CommitOutcome::Committed { message });
    }

    let text = output.combined().to_lowercase();
    if NOTHING_TO_COMMIT.iter().any(|m| text.contains(m)) {
        warn!(stage = %stage, "git reported nothing to commit");
        return Ok(CommitOutcome::NoOp);
    }

    Err(PipelineError::CommitFailed {
        stage,
        detail: output.combined().trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::RecordingRunner;

    fn workdir_with_state() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dvc.lock"), "schema: '2.0'\n").unwrap();
        std::fs::write(dir.path().join("params.yaml"), "split:\n  test_size: 0.2\n").unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_clean_tree_is_noop_without_commit() {
        let dir = workdir_with_state();
        let config = PipelineConfig::default().with_workdir(dir.path());
        let runner = RecordingRunner::new();

        let outcome = CommitGate::new(&config, &runner, &[])
            .commit_stage(Stage::Split)
            .await
            .unwrap();

        assert_eq!(outcome, CommitOutcome::NoOp);
        assert_eq!(
            runner.commands(),
            vec![
                "git add dvc.lock",
                "git add params.yaml",
                "git add src",
                "git diff --quiet",
                "git diff --cached --quiet",
            ]
        );
    }

    #[tokio::test]
    async fn test_staged_changes_are_committed() {
        let dir = workdir_with_state();
        let config = PipelineConfig::default().with_workdir(dir.path());
        let runner = RecordingRunner::new();
        runner.respond(&["git", "diff", "--cached"], CommandOutput::failed(1, ""));

        let outcome = CommitGate::new(&config, &runner, &[])
            .commit_stage(Stage::Training)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            CommitOutcome::Committed {
                message: "pipeline(training): retrain model".to_string()
            }
        );
        assert!(outcome.is_committed());
        assert_eq!(
            runner.commands().last().unwrap(),
            "git commit -m pipeline(training): retrain model"
        );
    }

    #[tokio::test]
    async fn test_nothing_to_commit_from_git_is_noop() {
        let dir = workdir_with_state();
        let config = PipelineConfig::default().with_workdir(dir.path());
        let runner = RecordingRunner::new();
        runner.respond(&["git", "diff", "--quiet"], CommandOutput::failed(1, ""));
        runner.respond(
            &["git", "commit"],
            CommandOutput::failed(1, "").with_stdout(
                "On branch main\nno changes added to commit (use \"git add\" and/or \"git commit -a\")\n",
            ),
        );

        let outcome = CommitGate::new(&config, &runner, &[])
            .commit_stage(Stage::Evaluate)
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::NoOp);
    }

    #[tokio::test]
    async fn test_other_commit_failures_are_fatal() {
        let dir = workdir_with_state();
        let config = PipelineConfig::default().with_workdir(dir.path());
        let runner = RecordingRunner::new();
        runner.respond(&["git", "diff", "--quiet"], CommandOutput::failed(1, ""));
        runner.fail(
            &["git", "commit"],
            128,
            "fatal: unable to auto-detect email address",
        );

        let err = CommitGate::new(&config, &runner, &[])
            .commit_stage(Stage::Split)
            .await
            .unwrap_err();
        match err {
            PipelineError::CommitFailed { stage, detail } => {
                assert_eq!(stage, Stage::Split);
                assert!(detail.contains("email"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_paths_are_not_added() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("params.yaml"), "").unwrap();
        let config = PipelineConfig::default().with_workdir(dir.path());
        let runner = RecordingRunner::new();

        CommitGate::new(&config, &runner, &[])
            .commit_stage(Stage::Split)
            .await
            .unwrap();

        let adds: Vec<String> = runner
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("git add"))
            .collect();
        assert_eq!(adds, vec!["git add params.yaml"]);
    }

    #[tokio::test]
    async fn test_add_failure_is_fatal() {
        let dir = workdir_with_state();
        let config = PipelineConfig::default().with_workdir(dir.path());
        let runner = RecordingRunner::new();
        runner.fail(&["git", "add"], 128, "fatal: not a git repository");

        let err = CommitGate::new(&config, &runner, &[])
            .commit_stage(Stage::Split)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::CommitFailed { .. }));
        assert_eq!(runner.commands(), vec!["git add dvc.lock"]);
    }
}
