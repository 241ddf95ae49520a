//! mlpipe core - staged ML pipeline orchestration
//!
//! Sequences the `split`, `training` and `evaluate` stages of a git + dvc
//! project:
//! - Probes the environment (virtual env, required tools, raw input data)
//! - Runs each stage script behind a filesystem precondition
//! - Commits pipeline state after every stage, tolerating "nothing to commit"
//! - Optionally pushes code and data after a full run
//!
//! External processes are reached through [`CommandRunner`] so the driver can
//! be exercised against [`fakes::RecordingRunner`].

pub mod config;
pub mod error;
pub mod exec;
pub mod fakes;
pub mod gate;
pub mod metrics;
pub mod pipeline;
pub mod probe;
pub mod push;
pub mod report;
pub mod runner;
pub mod stage;
pub mod telemetry;

// Re-export key types
pub use config::{PipelineConfig, PushPolicy};
pub use error::{ErrorKind, PipelineError, Result};
pub use exec::{CommandOutput, CommandRunner, Invocation, SubprocessRunner};
pub use gate::{CommitGate, CommitOutcome};
pub use metrics::MetricsRecord;
pub use pipeline::{PipelineDriver, RunObserver};
pub use probe::{ActiveEnvironment, EnvironmentProber, Preflight};
pub use push::{stdin_confirm, Confirm, PushConfirmer, PushReport, PushStatus};
pub use report::{PipelineReport, PipelineState};
pub use runner::{StageReport, StageRunner};
pub use stage::{Stage, StageSelector};
pub use telemetry::init_tracing;
