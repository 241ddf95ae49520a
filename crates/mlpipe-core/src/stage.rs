//! Pipeline stage definitions and the stage selector.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Interpreter the default stage commands run under.
pub const DEFAULT_PYTHON: &str = "python";

/// The three pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Split the raw input set into train/test data.
    Split,

    /// Fit the model on the processed data.
    Training,

    /// Score the trained model and write the metrics record.
    Evaluate,
}

impl Stage {
    /// All stages in the fixed order a full run executes them.
    pub const ORDER: [Stage; 3] = [Stage::Split, Stage::Training, Stage::Evaluate];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Split => "split",
            Stage::Training => "training",
            Stage::Evaluate => "evaluate",
        }
    }

    /// The stage whose output this stage consumes.
    pub fn upstream(&self) -> Option<Stage> {
        match self {
            Stage::Split => None,
            Stage::Training => Some(Stage::Split),
            Stage::Evaluate => Some(Stage::Training),
        }
    }

    /// Default script invocation, relative to the working directory.
    pub fn default_command(&self) -> Vec<String> {
        let script = match self {
            Stage::Split => "src/data/split.py",
            Stage::Training => "src/models/training.py",
            Stage::Evaluate => "src/models/evaluate.py",
        };
        vec![DEFAULT_PYTHON.to_string(), script.to_string()]
    }

    /// Commit message used by the commit gate after this stage.
    pub fn commit_message(&self) -> &'static str {
        match self {
            Stage::Split => "pipeline(split): refresh processed data",
            Stage::Training => "pipeline(training): retrain model",
            Stage::Evaluate => "pipeline(evaluate): update metrics",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "split" => Ok(Stage::Split),
            "training" => Ok(Stage::Training),
            "evaluate" => Ok(Stage::Evaluate),
            other => Err(PipelineError::UnknownStage(other.to_string())),
        }
    }
}

/// Which subset of stages a run executes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "mode", content = "stage")]
pub enum StageSelector {
    /// split -> training -> evaluate, then summary and optional push.
    #[default]
    All,

    /// Preflight plus exactly one stage.
    Only(Stage),
}

impl StageSelector {
    /// Stages this selector runs, in order.
    pub fn stages(&self) -> Vec<Stage> {
        match self {
            StageSelector::All => Stage::ORDER.to_vec(),
            StageSelector::Only(stage) => vec![*stage],
        }
    }

    pub fn is_full_run(&self) -> bool {
        matches!(self, StageSelector::All)
    }
}

impl fmt::Display for StageSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageSelector::All => f.write_str("all"),
            StageSelector::Only(stage) => write!(f, "{stage}"),
        }
    }
}

impl FromStr for StageSelector {
    type Err = PipelineError;

    /// Parse the closed set `all | split | training | evaluate`.
    ///
    /// Matching is exact; `ALL` or ` split` are rejected like any other
    /// unknown value.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            return Ok(StageSelector::All);
        }
        s.parse::<Stage>().map(StageSelector::Only)
    }
}
