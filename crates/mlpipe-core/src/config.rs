//! Pipeline configuration.
//!
//! Every path is relative to [`PipelineConfig::workdir`]. Defaults follow the
//! standard project layout (`data/raw_data`, `models/best_pipeline.pkl`, ...).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::stage::{Stage, DEFAULT_PYTHON};

/// When the full pipeline pushes code and data to remotes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PushPolicy {
    /// Push without asking.
    Always,
    /// Never push; print the manual commands instead.
    Never,
    /// Ask the operator before pushing.
    #[default]
    Prompt,
}

impl FromStr for PushPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(PushPolicy::Always),
            "never" => Ok(PushPolicy::Never),
            "prompt" => Ok(PushPolicy::Prompt),
            other => Err(format!(
                "invalid push policy `{other}`; expected always, never or prompt"
            )),
        }
    }
}

/// Configuration for one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Working directory all external commands run in.
    pub workdir: PathBuf,

    /// Raw input set; must be non-empty before any stage runs.
    pub raw_data_dir: PathBuf,

    /// Output of `split`, precondition of `training`.
    pub processed_data_dir: PathBuf,

    /// Output of `training`, precondition of `evaluate`.
    pub model_path: PathBuf,

    /// Output of `evaluate`; tracked by git directly.
    pub metrics_path: PathBuf,

    /// Parameter file read by the stage scripts.
    pub params_path: PathBuf,

    /// Data-versioning lock file.
    pub lock_path: PathBuf,

    /// Source tree committed alongside the lock file.
    pub source_dir: PathBuf,

    /// Local virtual environment activated when none is active.
    pub venv_dir: PathBuf,

    /// Already-active virtual environment (`VIRTUAL_ENV`), if any.
    pub active_venv: Option<PathBuf>,

    /// Executables that must be runnable before any stage starts.
    pub required_tools: Vec<String>,

    /// Per-stage command override; stages not listed use their default.
    pub stage_commands: BTreeMap<Stage, Vec<String>>,

    /// Git remote for code pushes.
    pub git_remote: String,

    /// Branch pushed first.
    pub primary_branch: String,

    /// Branch pushed when the primary push fails.
    pub fallback_branch: String,

    /// Push behaviour at the end of a full run.
    pub push_policy: PushPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            workdir: PathBuf::from("."),
            raw_data_dir: PathBuf::from("data/raw_data"),
            processed_data_dir: PathBuf::from("data/processed_data"),
            model_path: PathBuf::from("models/best_pipeline.pkl"),
            metrics_path: PathBuf::from("metrics/scores.json"),
            params_path: PathBuf::from("params.yaml"),
            lock_path: PathBuf::from("dvc.lock"),
            source_dir: PathBuf::from("src"),
            venv_dir: PathBuf::from(".venv"),
            active_venv: None,
            required_tools: vec![
                DEFAULT_PYTHON.to_string(),
                "dvc".to_string(),
                "git".to_string(),
            ],
            stage_commands: BTreeMap::new(),
            git_remote: "origin".to_string(),
            primary_branch: "main".to_string(),
            fallback_branch: "master".to_string(),
            push_policy: PushPolicy::Prompt,
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with the process environment.
    ///
    /// Reads `VIRTUAL_ENV`, `MLPIPE_PYTHON`, `MLPIPE_GIT_REMOTE` and
    /// `MLPIPE_VENV_DIR`.
    pub fn from_env() -> Self {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary variable lookup.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(venv) = lookup("VIRTUAL_ENV").filter(|v| !v.is_empty()) {
            self.active_venv = Some(PathBuf::from(venv));
        }
        if let Some(python) = lookup("MLPIPE_PYTHON").filter(|v| !v.is_empty()) {
            if let Some(slot) = self
                .required_tools
                .iter_mut()
                .find(|t| t.as_str() == DEFAULT_PYTHON)
            {
                *slot = python.clone();
            }
            // Only stages still run by the default interpreter; custom
            // commands such as `make split` keep their program.
            for stage in Stage::ORDER {
                let mut command = self.command_for(stage);
                if command.first().map(String::as_str) == Some(DEFAULT_PYTHON) {
                    command[0] = python.clone();
                    self.stage_commands.insert(stage, command);
                }
            }
        }
        if let Some(remote) = lookup("MLPIPE_GIT_REMOTE").filter(|v| !v.is_empty()) {
            self.git_remote = remote;
        }
        if let Some(venv_dir) = lookup("MLPIPE_VENV_DIR").filter(|v| !v.is_empty()) {
            self.venv_dir = PathBuf::from(venv_dir);
        }
        self
    }

    /// Use a different working directory.
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    /// Set the push policy.
    pub fn with_push_policy(mut self, policy: PushPolicy) -> Self {
        self.push_policy = policy;
        self
    }

    /// Override the command for one stage.
    pub fn with_stage_command(mut self, stage: Stage, command: Vec<String>) -> Self {
        self.stage_commands.insert(stage, command);
        self
    }

    /// Command a stage runs (override or default).
    pub fn command_for(&self, stage: Stage) -> Vec<String> {
        self.stage_commands
            .get(&stage)
            .filter(|c| !c.is_empty())
            .cloned()
            .unwrap_or_else(|| stage.default_command())
    }

    /// Resolve a configured path against the working directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        }
    }

    /// Artifact whose existence gates `stage`, if any.
    pub fn precondition_for(&self, stage: Stage) -> Option<&Path> {
        match stage {
            Stage::Split => None,
            Stage::Training => Some(self.processed_data_dir.as_path()),
            Stage::Evaluate => Some(self.model_path.as_path()),
        }
    }

    /// Paths the commit gate stages after every stage.
    pub fn commit_paths(&self) -> [&Path; 3] {
        [
            self.lock_path.as_path(),
            self.params_path.as_path(),
            self.source_dir.as_path(),
        ]
    }
}
