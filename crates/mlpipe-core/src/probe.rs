//! Environment probing: virtual environment, required tools, input data.
//!
//! Runs once before any stage. The first failed check aborts the run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::exec::{CommandRunner, Invocation};

/// How the Python environment for this run was obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "source", content = "path")]
pub enum EnvironmentSource {
    /// `VIRTUAL_ENV` was already set by the caller.
    AlreadyActive(PathBuf),
    /// Activated from the project's local virtual environment.
    Activated(PathBuf),
}

/// The environment every external command of this run executes under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveEnvironment {
    pub source: EnvironmentSource,

    /// Variables layered onto each child process.
    pub overlay: Vec<(String, String)>,
}

impl ActiveEnvironment {
    /// An environment that adds nothing to child processes.
    pub fn inherited(venv: PathBuf) -> Self {
        ActiveEnvironment {
            source: EnvironmentSource::AlreadyActive(venv),
            overlay: Vec::new(),
        }
    }

    pub fn venv_path(&self) -> &Path {
        match &self.source {
            EnvironmentSource::AlreadyActive(p) | EnvironmentSource::Activated(p) => p,
        }
    }
}

/// Outcome of a successful preflight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preflight {
    pub environment: ActiveEnvironment,

    /// Tools confirmed runnable, in check order.
    pub tools: Vec<String>,

    /// Files found in the raw input directory.
    pub input_files: Vec<PathBuf>,
}

/// Checks the environment before any stage runs.
pub struct EnvironmentProber<'a> {
    config: &'a PipelineConfig,
    runner: &'a dyn CommandRunner,
}

impl<'a> EnvironmentProber<'a> {
    pub fn new(config: &'a PipelineConfig, runner: &'a dyn CommandRunner) -> Self {
        EnvironmentProber { config, runner }
    }

    /// Activate the environment, then check tools, then check input data.
    pub async fn probe(&self) -> Result<Preflight> {
        let environment = self.activate()?;
        let tools = self.check_tools(&environment).await?;
        let input_files = self.check_input()?;
        info!(
            venv = %environment.venv_path().display(),
            tools = ?tools,
            input_files = input_files.len(),
            "Preflight passed"
        );
        Ok(Preflight {
            environment,
            tools,
            input_files,
        })
    }

    /// Use the active virtual environment or activate the local one.
    ///
    /// Activation does not touch this process's environment; it produces the
    /// `VIRTUAL_ENV` / `PATH` overlay applied to every child process.
    pub fn activate(&self) -> Result<ActiveEnvironment> {
        if let Some(active) = &self.config.active_venv {
            debug!(venv = %active.display(), "Virtual environment already active");
            return Ok(ActiveEnvironment::inherited(active.clone()));
        }

        let venv = self.config.resolve(&self.config.venv_dir);
        let bin = venv.join(bin_dir());
        if !bin.join(activate_script()).is_file() {
            return Err(PipelineError::EnvironmentUnavailable {
                path: self.config.venv_dir.clone(),
            });
        }

        let venv = venv.canonicalize()?;
        let bin = venv.join(bin_dir());
        let path = match std::env::var_os("PATH") {
            Some(existing) => {
                let mut parts = vec![bin.clone()];
                parts.extend(std::env::split_paths(&existing));
                std::env::join_paths(parts)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?
            }
            None => bin.clone().into_os_string(),
        };

        info!(venv = %venv.display(), "Activated local virtual environment");
        Ok(ActiveEnvironment {
            overlay: vec![
                (
                    "VIRTUAL_ENV".to_string(),
                    venv.to_string_lossy().into_owned(),
                ),
                ("PATH".to_string(), path.to_string_lossy().into_owned()),
            ],
            source: EnvironmentSource::Activated(venv),
        })
    }

    /// Check each required tool in order; the first missing one fails.
    ///
    /// A tool counts as present when `<tool> --version` starts and exits 0.
    pub async fn check_tools(&self, environment: &ActiveEnvironment) -> Result<Vec<String>> {
        let mut found = Vec::with_capacity(self.config.required_tools.len());
        for tool in &self.config.required_tools {
            let invocation = Invocation::new(tool.clone(), ["--version"], &self.config.workdir)
                .with_envs(&environment.overlay);
            let present = match self.runner.run(&invocation).await {
                Ok(output) => output.success(),
                Err(PipelineError::Spawn { .. }) => false,
                Err(other) => return Err(other),
            };
            if !present {
                return Err(PipelineError::MissingTool { tool: tool.clone() });
            }
            debug!(tool = %tool, "Tool available");
            found.push(tool.clone());
        }
        Ok(found)
    }

    /// The raw input directory must hold at least one non-hidden file.
    pub fn check_input(&self) -> Result<Vec<PathBuf>> {
        let dir = self.config.resolve(&self.config.raw_data_dir);
        let empty = || PipelineError::EmptyInput {
            dir: self.config.raw_data_dir.clone(),
        };
        if !dir.is_dir() {
            return Err(empty());
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && !is_hidden(p))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(empty());
        }
        Ok(files)
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

#[cfg(windows)]
fn bin_dir() -> &'static str {
    "Scripts"
}

#[cfg(not(windows))]
fn bin_dir() -> &'static str {
    "bin"
}

#[cfg(windows)]
fn activate_script() -> &'static str {
    "activate.bat"
}

#[cfg(not(windows))]
fn activate_script() -> &'static str {
    "activate"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::RecordingRunner;

    fn config_in(dir: &Path) -> PipelineConfig {
        PipelineConfig::default().with_workdir(dir)
    }

    #[test]
    fn test_active_venv_is_used_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.active_venv = Some(PathBuf::from("/opt/venv"));
        let runner = RecordingRunner::new();

        let env = EnvironmentProber::new(&config, &runner).activate().unwrap();
        assert_eq!(
            env.source,
            EnvironmentSource::AlreadyActive(PathBuf::from("/opt/venv"))
        );
        assert!(env.overlay.is_empty());
    }

    #[test]
    fn test_missing_local_venv_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let runner = RecordingRunner::new();

        let err = EnvironmentProber::new(&config, &runner)
            .activate()
            .unwrap_err();
        assert!(matches!(err, PipelineError::EnvironmentUnavailable { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_local_venv_activation_builds_overlay() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".venv/bin")).unwrap();
        std::fs::write(dir.path().join(".venv/bin/activate"), "").unwrap();
        let config = config_in(dir.path());
        let runner = RecordingRunner::new();

        let env = EnvironmentProber::new(&config, &runner).activate().unwrap();
        assert!(matches!(env.source, EnvironmentSource::Activated(_)));
        let venv = dir.path().join(".venv").canonicalize().unwrap();
        assert!(env
            .overlay
            .contains(&("VIRTUAL_ENV".to_string(), venv.to_string_lossy().into_owned())));
        let path = env
            .overlay
            .iter()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(path.starts_with(&*venv.join("bin").to_string_lossy()));
    }

    #[tokio::test]
    async fn test_first_missing_tool_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let runner = RecordingRunner::new();
        runner.missing("dvc");
        runner.missing("git");

        let env = ActiveEnvironment::inherited(PathBuf::from("/opt/venv"));
        let err = EnvironmentProber::new(&config, &runner)
            .check_tools(&env)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingTool { ref tool } if tool == "dvc"));
        // git is never probed once dvc is missing
        assert_eq!(runner.commands(), vec!["python --version", "dvc --version"]);
    }

    #[tokio::test]
    async fn test_tool_exiting_nonzero_counts_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let runner = RecordingRunner::new();
        runner.fail(&["python", "--version"], 127, "");

        let env = ActiveEnvironment::inherited(PathBuf::from("/opt/venv"));
        let err = EnvironmentProber::new(&config, &runner)
            .check_tools(&env)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingTool { ref tool } if tool == "python"));
    }

    #[test]
    fn test_input_dir_must_have_visible_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let runner = RecordingRunner::new();
        let prober = EnvironmentProber::new(&config, &runner);

        assert!(matches!(
            prober.check_input().unwrap_err(),
            PipelineError::EmptyInput { .. }
        ));

        let raw = dir.path().join("data/raw_data");
        std::fs::create_dir_all(raw.join("nested")).unwrap();
        std::fs::write(raw.join(".gitkeep"), "").unwrap();
        assert!(matches!(
            prober.check_input().unwrap_err(),
            PipelineError::EmptyInput { .. }
        ));

        std::fs::write(raw.join("housing.csv"), "a,b\n1,2\n").unwrap();
        let files = prober.check_input().unwrap();
        assert_eq!(files, vec![raw.join("housing.csv")]);
    }

    #[tokio::test]
    async fn test_probe_checks_environment_before_tools() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let runner = RecordingRunner::new();

        let err = EnvironmentProber::new(&config, &runner)
            .probe()
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EnvironmentUnavailable { .. }));
        assert!(runner.calls().is_empty());
    }
}
