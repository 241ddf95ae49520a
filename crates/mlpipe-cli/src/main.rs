//! mlpipe - staged ML pipeline driver
//!
//! Runs the `split`, `training` and `evaluate` stages of a git + dvc project,
//! committing pipeline state after each stage.
//!
//! ## Usage
//!
//! - `mlpipe`: full run, then offer to push code and data
//! - `mlpipe training`: run one stage, never push
//! - `mlpipe --check`: environment preflight only

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use mlpipe_core::{
    init_tracing, stdin_confirm, PipelineConfig, PipelineDriver, PipelineReport, Preflight,
    PushPolicy, PushStatus, RunObserver, StageReport, StageSelector, SubprocessRunner,
};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "mlpipe")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run the split / training / evaluate pipeline", long_about = None)]
struct Cli {
    /// Stage to run: all, split, training or evaluate
    #[arg(default_value = "all")]
    stage: String,

    /// Push policy after a full run: always, never or prompt
    #[arg(long, env = "MLPIPE_PUSH")]
    push: Option<PushPolicy>,

    /// Push without asking (same as --push always)
    #[arg(short, long)]
    yes: bool,

    /// Project directory (default: current directory)
    #[arg(long, env = "MLPIPE_WORKDIR")]
    workdir: Option<PathBuf>,

    /// Write the run report as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Only check the environment; run no stage
    #[arg(long)]
    check: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

impl Cli {
    /// Push policy from `--yes`, `--push`, then the configured default.
    fn push_policy(&self, configured: PushPolicy) -> PushPolicy {
        if self.yes {
            PushPolicy::Always
        } else {
            self.push.unwrap_or(configured)
        }
    }

    fn config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::from_env();
        if let Some(workdir) = &self.workdir {
            config = config.with_workdir(workdir);
        }
        let policy = self.push_policy(config.push_policy);
        config.with_push_policy(policy)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let selector: StageSelector = match cli.stage.parse() {
        Ok(selector) => selector,
        Err(e) => {
            eprintln!("✗ {e}\n");
            eprintln!("{}", Cli::command().render_usage());
            return ExitCode::FAILURE;
        }
    };

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    match run(&cli, selector).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\n✗ {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, selector: StageSelector) -> Result<()> {
    let driver = PipelineDriver::new(
        cli.config(),
        Arc::new(SubprocessRunner::new()),
        Arc::new(stdin_confirm()),
    )
    .with_observer(Arc::new(ConsoleObserver));

    if cli.check {
        let preflight = driver.preflight().await.context("Preflight failed")?;
        print_preflight(&preflight);
        return Ok(());
    }

    info!(selector = %selector, "Running pipeline");
    let report = driver
        .run(selector)
        .await
        .with_context(|| format!("Pipeline `{selector}` failed"))?;
    print_report(&report);

    if let Some(path) = &cli.report {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        println!("\nReport written to {}", path.display());
    }
    Ok(())
}

fn print_preflight(preflight: &Preflight) {
    println!(
        "Virtual env: {}",
        preflight.environment.venv_path().display()
    );
    println!("Tools: {}", preflight.tools.join(", "));
    println!("Input files: {}", preflight.input_files.len());
    println!("\n✓ Environment ready");
}

/// Prints each stage as it finishes, so metrics appear before the push prompt.
struct ConsoleObserver;

impl RunObserver for ConsoleObserver {
    fn stage_finished(&self, report: &StageReport) {
        let mut stdout = std::io::stdout().lock();
        // The push prompt goes to stderr; flush so this lands first.
        let _ = write!(stdout, "{}", render_stage(report)).and_then(|_| stdout.flush());
    }
}

fn render_stage(report: &StageReport) -> String {
    let commit = if report.commit.is_committed() {
        "committed"
    } else {
        "nothing to commit"
    };
    let mut out = format!(
        "  ✓ {} ({}ms, {})\n",
        report.stage, report.duration_ms, commit
    );
    if let Some(metrics) = report.metrics_text() {
        out.push_str("\nMetrics:\n");
        out.push_str(&metrics);
        out.push('\n');
    }
    out
}

fn print_report(report: &PipelineReport) {
    println!("\nRun ID: {}", report.run_id);
    println!("Duration: {}ms", report.duration_ms);

    if report.inputs_changed() {
        println!("\nPipeline inputs changed during this run (dvc.lock or params.yaml)");
    }

    if let Some(push) = &report.push {
        println!();
        for (what, status) in [("Code", &push.code), ("Data", &push.data)] {
            match status {
                PushStatus::Pushed { target } => println!("✓ {what} pushed to {target}"),
                PushStatus::Failed { warning } => println!("⚠ {what}: {warning}"),
                PushStatus::Skipped => {}
            }
        }
        if !push.manual_commands.is_empty() {
            println!("To push later, run:");
            for command in &push.manual_commands {
                println!("  {command}");
            }
        }
    }

    if !report.next_steps.is_empty() {
        println!("\nNext steps:");
        for step in &report.next_steps {
            println!("  {step}");
        }
    }

    println!(
        "\n✓ {} stage(s) completed, {} committed",
        report.stages.len(),
        report.committed_count()
    );
}
