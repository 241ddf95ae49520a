//! Run report: what one orchestrator run did.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::metrics::MetricsRecord;
use crate::probe::Preflight;
use crate::push::PushReport;
use crate::runner::StageReport;
use crate::stage::{Stage, StageSelector};

/// Driver states, in the order a run visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "stage")]
pub enum PipelineState {
    Idle,
    Preflight,
    Stage(Stage),
    Summary,
    Push,
    Done,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Idle => f.write_str("idle"),
            PipelineState::Preflight => f.write_str("preflight"),
            PipelineState::Stage(stage) => write!(f, "stage:{stage}"),
            PipelineState::Summary => f.write_str("summary"),
            PipelineState::Push => f.write_str("push"),
            PipelineState::Done => f.write_str("done"),
        }
    }
}

/// Commands suggested to the operator after a full run.
pub const NEXT_STEPS: [&str; 4] = [
    "dvc metrics show",
    "dvc dag",
    "git log --oneline -5",
    "dvc exp run --set-param <param>=<value>",
];

/// SHA-256 digests of the files that define a run's inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFingerprint {
    /// Digest of the parameter file, if present.
    pub params: Option<String>,

    /// Digest of the data-versioning lock file, if present.
    pub lock: Option<String>,
}

impl InputFingerprint {
    pub fn capture(config: &PipelineConfig) -> Result<Self> {
        Ok(InputFingerprint {
            params: file_digest(&config.resolve(&config.params_path))?,
            lock: file_digest(&config.resolve(&config.lock_path))?,
        })
    }
}

/// Hex SHA-256 of a file, `None` if it does not exist.
pub fn file_digest(path: &Path) -> Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    let content = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(Some(hex::encode(hasher.finalize())))
}

/// Record of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub selector: StageSelector,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,

    /// States visited, starting at `Idle` and ending at `Done`.
    pub transitions: Vec<PipelineState>,

    pub preflight: Option<Preflight>,
    pub stages: Vec<StageReport>,

    /// Present only for a full run.
    pub push: Option<PushReport>,

    /// Present only for a full run.
    pub next_steps: Vec<String>,

    pub inputs_before: InputFingerprint,
    pub inputs_after: InputFingerprint,
}

impl PipelineReport {
    /// Metrics from the evaluate stage, if it ran and produced them.
    pub fn metrics(&self) -> Option<&MetricsRecord> {
        self.stages
            .iter()
            .find(|s| s.stage == Stage::Evaluate)
            .and_then(|s| s.metrics.as_ref())
    }

    /// Number of stages that created a commit.
    pub fn committed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.commit.is_committed()).count()
    }

    /// Whether the lock file or parameters changed during the run.
    pub fn inputs_changed(&self) -> bool {
        self.inputs_before != self.inputs_after
    }

    /// Write the report as pretty JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::CommitOutcome;

    fn stage_report(stage: Stage, commit: CommitOutcome) -> StageReport {
        StageReport {
            stage,
            command: format!("python {stage}.py"),
            exit_code: 0,
            duration_ms: 10,
            commit,
            metrics: None,
            metrics_raw: None,
        }
    }

    fn report(stages: Vec<StageReport>) -> PipelineReport {
        let now = Utc::now();
        PipelineReport {
            run_id: Uuid::new_v4(),
            selector: StageSelector::All,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            transitions: vec![PipelineState::Idle, PipelineState::Done],
            preflight: None,
            stages,
            push: None,
            next_steps: Vec::new(),
            inputs_before: InputFingerprint::default(),
            inputs_after: InputFingerprint::default(),
        }
    }

    #[test]
    fn test_file_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.yaml");
        assert_eq!(file_digest(&path).unwrap(), None);

        std::fs::write(&path, "split:\n  test_size: 0.2\n").unwrap();
        let first = file_digest(&path).unwrap().unwrap();
        assert_eq!(first.len(), 64);

        std::fs::write(&path, "split:\n  test_size: 0.3\n").unwrap();
        let second = file_digest(&path).unwrap().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_committed_count_and_metrics() {
        let mut evaluate = stage_report(Stage::Evaluate, CommitOutcome::NoOp);
        evaluate.metrics = Some(MetricsRecord::parse(r#"{"r2": 0.7}"#).unwrap());
        let report = report(vec![
            stage_report(
                Stage::Split,
                CommitOutcome::Committed {
                    message: "m".to_string(),
                },
            ),
            stage_report(Stage::Training, CommitOutcome::NoOp),
            evaluate,
        ]);

        assert_eq!(report.committed_count(), 1);
        assert_eq!(report.metrics().unwrap().get("r2"), Some(0.7));
        assert!(!report.inputs_changed());
    }

    #[test]
    fn test_write_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/run.json");
        let report = report(vec![stage_report(Stage::Split, CommitOutcome::NoOp)]);

        report.write_json(&path).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["selector"]["mode"], "all");
        assert_eq!(value["stages"][0]["stage"], "split");
        assert_eq!(value["stages"][0]["commit"]["outcome"], "no_op");
        assert_eq!(value["transitions"][0]["state"], "idle");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(PipelineState::Stage(Stage::Training).to_string(), "stage:training");
        assert_eq!(PipelineState::Done.to_string(), "done");
    }
}
