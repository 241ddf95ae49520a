//! Pipeline driver: runs the selected stages as an explicit state sequence.
//!
//! Full run:     idle -> preflight -> split -> training -> evaluate -> summary -> push -> done
//! Single stage: idle -> preflight -> <stage> -> done
//!
//! Any error is terminal. Stages run strictly one after another; a later
//! stage never starts after an earlier one failed.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::exec::CommandRunner;
use crate::probe::{EnvironmentProber, Preflight};
use crate::push::{Confirm, PushConfirmer, PushReport};
use crate::report::{InputFingerprint, PipelineReport, PipelineState, NEXT_STEPS};
use crate::runner::{StageReport, StageRunner};
use crate::stage::StageSelector;

/// Progress callbacks while a run is in flight.
///
/// Called synchronously from the driver, so output produced here appears
/// before anything the next state does (including the push prompt).
pub trait RunObserver: Send + Sync {
    /// A stage finished and was committed.
    fn stage_finished(&self, _report: &StageReport) {}
}

/// Orchestrates preflight, stages, commit gating and push.
pub struct PipelineDriver {
    config: PipelineConfig,
    runner: Arc<dyn CommandRunner>,
    confirm: Arc<dyn Confirm>,
    observer: Option<Arc<dyn RunObserver>>,
}

impl PipelineDriver {
    pub fn new(
        config: PipelineConfig,
        runner: Arc<dyn CommandRunner>,
        confirm: Arc<dyn Confirm>,
    ) -> Self {
        PipelineDriver {
            config,
            runner,
            confirm,
            observer: None,
        }
    }

    /// Report stage progress to `observer` during the run.
    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run only the environment checks.
    pub async fn preflight(&self) -> Result<Preflight> {
        EnvironmentProber::new(&self.config, self.runner.as_ref())
            .probe()
            .await
    }

    /// Execute the stages chosen by `selector`.
    pub async fn run(&self, selector: StageSelector) -> Result<PipelineReport> {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut run = RunState::new();

        info!(
            run_id = %run.run_id,
            selector = %selector,
            workdir = %self.config.workdir.display(),
            "Starting pipeline"
        );

        if let Err(e) = self.execute(selector, &mut run).await {
            error!(run_id = %run.run_id, state = %run.current(), error = %e, "Pipeline failed");
            return Err(e);
        }

        run.enter(PipelineState::Done);
        let inputs_after = InputFingerprint::capture(&self.config)?;
        let duration_ms = start.elapsed().as_millis() as u64;
        info!(run_id = %run.run_id, duration_ms, "Pipeline completed");

        Ok(PipelineReport {
            run_id: run.run_id,
            selector,
            started_at,
            finished_at: Utc::now(),
            duration_ms,
            transitions: run.transitions,
            preflight: run.preflight,
            stages: run.stages,
            push: run.push,
            next_steps: run.next_steps,
            inputs_before: run.inputs_before,
            inputs_after,
        })
    }

    async fn execute(&self, selector: StageSelector, run: &mut RunState) -> Result<()> {
        run.enter(PipelineState::Preflight);
        let preflight = self.preflight().await?;
        let envs = preflight.environment.overlay.clone();
        run.preflight = Some(preflight);
        run.inputs_before = InputFingerprint::capture(&self.config)?;

        let stage_runner = StageRunner::new(&self.config, self.runner.as_ref(), &envs);
        for stage in selector.stages() {
            run.enter(PipelineState::Stage(stage));
            let report = stage_runner.run(stage).await?;
            if let Some(observer) = &self.observer {
                observer.stage_finished(&report);
            }
            run.stages.push(report);
        }

        if !selector.is_full_run() {
            return Ok(());
        }

        run.enter(PipelineState::Summary);
        let committed = run.stages.iter().filter(|s| s.commit.is_committed()).count();
        info!(stages = run.stages.len(), committed, "All stages passed");
        if let Some(metrics) = run.stages.iter().find_map(|s| s.metrics.as_ref()) {
            info!(metrics = ?metrics.entries(), "Evaluation metrics");
        }
        run.next_steps = NEXT_STEPS.iter().map(|s| s.to_string()).collect();

        run.enter(PipelineState::Push);
        let push = PushConfirmer::new(
            &self.config,
            self.runner.as_ref(),
            self.confirm.as_ref(),
            &envs,
        )
        .run()
        .await?;
        run.push = Some(push);
        Ok(())
    }
}

/// Everything a run accumulates before it reaches `Done`.
struct RunState {
    run_id: Uuid,
    transitions: Vec<PipelineState>,
    preflight: Option<Preflight>,
    stages: Vec<StageReport>,
    push: Option<PushReport>,
    next_steps: Vec<String>,
    inputs_before: InputFingerprint,
}

impl RunState {
    fn new() -> Self {
        RunState {
            run_id: Uuid::new_v4(),
            transitions: vec![PipelineState::Idle],
            preflight: None,
            stages: Vec::new(),
            push: None,
            next_steps: Vec::new(),
            inputs_before: InputFingerprint::default(),
        }
    }

    fn current(&self) -> PipelineState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(PipelineState::Idle)
    }

    fn enter(&mut self, state: PipelineState) {
        info!(run_id = %self.run_id, from = %self.current(), to = %state, "Pipeline transition");
        self.transitions.push(state);
    }
}
