//! Stage execution: precondition, script invocation, post-actions.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::exec::{CommandRunner, Invocation};
use crate::gate::{CommitGate, CommitOutcome};
use crate::metrics::MetricsRecord;
use crate::stage::Stage;

/// Result of a successful stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,

    /// Command line that was run.
    pub command: String,

    /// Exit code of the stage script (always 0 in a report).
    pub exit_code: i32,

    /// Duration of the stage script in milliseconds.
    pub duration_ms: u64,

    pub commit: CommitOutcome,

    /// Metrics read after `evaluate`, when the record exists and parses.
    pub metrics: Option<MetricsRecord>,

    /// Raw record text when it exists but is not strict JSON
    /// (e.g. `Infinity` or `NaN` written by the evaluation script).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_raw: Option<String>,
}

impl StageReport {
    /// Metrics as shown to the operator: the parsed record, or the raw text.
    pub fn metrics_text(&self) -> Option<String> {
        match (&self.metrics, &self.metrics_raw) {
            (Some(record), _) => Some(record.to_string()),
            (None, Some(raw)) => Some(
                raw.trim_end()
                    .lines()
                    .map(|line| format!("  {line}\n"))
                    .collect(),
            ),
            (None, None) => None,
        }
    }
}

/// Runs one stage against a working directory.
pub struct StageRunner<'a> {
    config: &'a PipelineConfig,
    runner: &'a dyn CommandRunner,
    envs: &'a [(String, String)],
}

impl<'a> StageRunner<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        runner: &'a dyn CommandRunner,
        envs: &'a [(String, String)],
    ) -> Self {
        StageRunner {
            config,
            runner,
            envs,
        }
    }

    /// Check that the upstream artifact for `stage` exists.
    pub fn check_precondition(&self, stage: Stage) -> Result<()> {
        let (Some(path), Some(upstream)) = (self.config.precondition_for(stage), stage.upstream())
        else {
            return Ok(());
        };
        if self.config.resolve(path).exists() {
            Ok(())
        } else {
            Err(PipelineError::Precondition {
                stage,
                path: path.to_path_buf(),
                upstream,
            })
        }
    }

    /// Execute a stage: precondition, script, post-actions, commit.
    ///
    /// Any error is terminal for the run; artifacts from earlier stages are
    /// left on disk.
    pub async fn run(&self, stage: Stage) -> Result<StageReport> {
        self.check_precondition(stage)?;

        let argv = self.config.command_for(stage);
        let invocation = Invocation::from_argv(&argv, &self.config.workdir)?
            .with_envs(self.envs)
            .inherit_output();

        info!(stage = %stage, command = %invocation, "Running stage");
        let start = Instant::now();
        let output = self.runner.run(&invocation).await?;
        let output = output.require_success(&invocation)?;
        let duration_ms = start.elapsed().as_millis() as u64;

        info!(
            stage = %stage,
            duration_ms,
            "Stage finished; outputs are declared in dvc.yaml and not verified here"
        );

        let gate = CommitGate::new(self.config, self.runner, self.envs);
        if stage == Stage::Evaluate {
            let metrics_path = &self.config.metrics_path;
            if self.config.resolve(metrics_path).exists() {
                gate.stage_path(stage, metrics_path).await?;
            } else {
                warn!(path = %metrics_path.display(), "Metrics record not produced");
            }
        }

        let commit = gate.commit_stage(stage).await?;

        let (metrics, metrics_raw) = if stage == Stage::Evaluate {
            self.read_metrics()
        } else {
            (None, None)
        };

        Ok(StageReport {
            stage,
            command: invocation.to_string(),
            exit_code: output.exit_code.unwrap_or_default(),
            duration_ms,
            commit,
            metrics,
            metrics_raw,
        })
    }

    /// Parsed record, or the raw text when it is present but does not parse.
    fn read_metrics(&self) -> (Option<MetricsRecord>, Option<String>) {
        let path = self.config.resolve(&self.config.metrics_path);
        if !path.is_file() {
            return (None, None);
        }
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read metrics record");
                return (None, None);
            }
        };
        match MetricsRecord::parse(&content) {
            Ok(record) => {
                info!(path = %path.display(), metrics = record.len(), "Metrics recorded");
                (Some(record), None)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Metrics record is not strict JSON; keeping raw text");
                (None, Some(content))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::OutputMode;
    use crate::fakes::RecordingRunner;

    #[test]
    fn test_training_requires_processed_data() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::default().with_workdir(dir.path());
        let runner = RecordingRunner::new();
        let stages = StageRunner::new(&config, &runner, &[]);

        assert!(stages.check_precondition(Stage::Split).is_ok());
        let err = stages.check_precondition(Stage::Training).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Precondition {
                stage: Stage::Training,
                upstream: Stage::Split,
                ..
            }
        ));

        std::fs::create_dir_all(dir.path().join("data/processed_data")).unwrap();
        assert!(stages.check_precondition(Stage::Training).is_ok());
    }

    #[tokio::test]
    async fn test_evaluate_without_model_never_invokes_script() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::default().with_workdir(dir.path());
        let runner = RecordingRunner::new();

        let err = StageRunner::new(&config, &runner, &[])
            .run(Stage::Evaluate)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Precondition {
                upstream: Stage::Training,
                ..
            }
        ));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_script_failure_skips_commit() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::default().with_workdir(dir.path());
        let runner = RecordingRunner::new();
        runner.fail(&["python", "src/data/split.py"], 1, "FileNotFoundError");

        let err = StageRunner::new(&config, &runner, &[])
            .run(Stage::Split)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::CommandFailed {
                exit_code: Some(1),
                ..
            }
        ));
        assert_eq!(runner.commands(), vec!["python src/data/split.py"]);
    }

    #[tokio::test]
    async fn test_stage_script_streams_output_with_env_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::default().with_workdir(dir.path());
        let runner = RecordingRunner::new();
        let envs = vec![("VIRTUAL_ENV".to_string(), "/v".to_string())];

        let report = StageRunner::new(&config, &runner, &envs)
            .run(Stage::Split)
            .await
            .unwrap();

        assert_eq!(report.command, "python src/data/split.py");
        assert_eq!(report.commit, CommitOutcome::NoOp);
        let calls = runner.calls();
        assert_eq!(calls[0].output, OutputMode::Inherit);
        assert_eq!(calls[0].envs, envs);
        assert!(calls[1..].iter().all(|c| c.envs == envs));
    }

    #[tokio::test]
    async fn test_evaluate_stages_metrics_and_reads_them() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("models")).unwrap();
        std::fs::write(dir.path().join("models/best_pipeline.pkl"), b"model").unwrap();
        let config = PipelineConfig::default().with_workdir(dir.path());
        let runner = RecordingRunner::new();
        runner.creates_file(
            &["python", "src/models/evaluate.py"],
            "metrics/scores.json",
            r#"{"mse": 4.0, "r2": 0.91}"#,
        );

        let report = StageRunner::new(&config, &runner, &[])
            .run(Stage::Evaluate)
            .await
            .unwrap();

        let metrics = report.metrics.expect("metrics should be read");
        assert_eq!(metrics.get("r2"), Some(0.91));
        let add_metrics = runner.position("git add metrics/scores.json").unwrap();
        let diff = runner.position("git diff").unwrap();
        assert!(add_metrics < diff);
    }

    #[tokio::test]
    async fn test_non_finite_metrics_keep_raw_text() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("models")).unwrap();
        std::fs::write(dir.path().join("models/best_pipeline.pkl"), b"model").unwrap();
        let config = PipelineConfig::default().with_workdir(dir.path());
        let runner = RecordingRunner::new();
        runner.creates_file(
            &["python", "src/models/evaluate.py"],
            "metrics/scores.json",
            r#"{"mse": 4.0, "r2": 0.9, "mape": Infinity}"#,
        );

        let report = StageRunner::new(&config, &runner, &[])
            .run(Stage::Evaluate)
            .await
            .unwrap();

        assert!(report.metrics.is_none());
        let text = report.metrics_text().expect("raw record should be shown");
        assert!(text.contains("Infinity"));
        assert!(text.contains("\"r2\": 0.9"));
    }

    #[test]
    fn test_metrics_text_prefers_parsed_record() {
        let report = StageReport {
            stage: Stage::Evaluate,
            command: "python src/models/evaluate.py".to_string(),
            exit_code: 0,
            duration_ms: 5,
            commit: CommitOutcome::NoOp,
            metrics: Some(MetricsRecord::parse(r#"{"r2": 0.5}"#).unwrap()),
            metrics_raw: None,
        };
        assert_eq!(report.metrics_text().unwrap(), "  R2: 0.5000\n");
    }

    #[tokio::test]
    async fn test_evaluate_without_metrics_file_still_commits() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("models")).unwrap();
        std::fs::write(dir.path().join("models/best_pipeline.pkl"), b"model").unwrap();
        let config = PipelineConfig::default().with_workdir(dir.path());
        let runner = RecordingRunner::new();

        let report = StageRunner::new(&config, &runner, &[])
            .run(Stage::Evaluate)
            .await
            .unwrap();
        assert!(report.metrics.is_none());
        assert!(report.metrics_text().is_none());
        assert!(runner.position("git add metrics").is_none());
    }
}
