//! In-memory fakes for the orchestrator's seams (testing only)
//!
//! Provides `RecordingRunner`, a [`CommandRunner`] that records every
//! invocation and answers from scripted rules, and `ScriptedConfirm`, a
//! [`Confirm`] with a fixed answer.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{PipelineError, Result};
use crate::exec::{CommandOutput, CommandRunner, Invocation};
use crate::push::Confirm;

// ---------------------------------------------------------------------------
// RecordingRunner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Reply {
    Output(CommandOutput),
    NotFound,
}

#[derive(Debug, Clone)]
enum Effect {
    Dir(PathBuf),
    File(PathBuf, String),
}

#[derive(Debug, Clone)]
struct Rule<T> {
    prefix: Vec<String>,
    value: T,
}

impl<T> Rule<T> {
    fn matches(&self, invocation: &Invocation) -> bool {
        let argv = invocation.argv();
        argv.len() >= self.prefix.len() && self.prefix.iter().zip(&argv).all(|(p, a)| p == a)
    }
}

fn prefix_of(prefix: &[&str]) -> Vec<String> {
    prefix.iter().map(|s| s.to_string()).collect()
}

/// Scripted command runner.
///
/// Every invocation succeeds silently unless a rule says otherwise. Rules
/// match on an argv prefix (`["git", "commit"]` matches any commit); when
/// several reply rules match, the most recently added one wins. File effects
/// are applied relative to the invocation's working directory, and only
/// when the reply is a successful exit.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    replies: Mutex<Vec<Rule<Reply>>>,
    effects: Mutex<Vec<Rule<Effect>>>,
    calls: Mutex<Vec<Invocation>>,
    spawned: AtomicUsize,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer matching invocations with `output`.
    pub fn respond(&self, prefix: &[&str], output: CommandOutput) -> &Self {
        self.replies.lock().unwrap().push(Rule {
            prefix: prefix_of(prefix),
            value: Reply::Output(output),
        });
        self
    }

    /// Make matching invocations exit with `exit_code` and `stderr`.
    pub fn fail(&self, prefix: &[&str], exit_code: i32, stderr: &str) -> &Self {
        self.respond(prefix, CommandOutput::failed(exit_code, stderr))
    }

    /// Make `program` fail to start, as if it were not installed.
    pub fn missing(&self, program: &str) -> &Self {
        self.replies.lock().unwrap().push(Rule {
            prefix: vec![program.to_string()],
            value: Reply::NotFound,
        });
        self
    }

    /// Create directory `path` when a matching invocation succeeds.
    pub fn creates_dir(&self, prefix: &[&str], path: impl Into<PathBuf>) -> &Self {
        self.effects.lock().unwrap().push(Rule {
            prefix: prefix_of(prefix),
            value: Effect::Dir(path.into()),
        });
        self
    }

    /// Write `contents` to `path` when a matching invocation succeeds.
    pub fn creates_file(
        &self,
        prefix: &[&str],
        path: impl Into<PathBuf>,
        contents: &str,
    ) -> &Self {
        self.effects.lock().unwrap().push(Rule {
            prefix: prefix_of(prefix),
            value: Effect::File(path.into(), contents.to_string()),
        });
        self
    }

    /// Every invocation seen so far, in order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Every invocation rendered as a command line.
    pub fn commands(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }

    /// Position of the first command line starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.starts_with(prefix))
    }

    /// Number of calls that were answered as started processes.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    fn apply_effects(&self, invocation: &Invocation) -> std::io::Result<()> {
        let effects = self.effects.lock().unwrap().clone();
        for rule in effects.iter().filter(|r| r.matches(invocation)) {
            match &rule.value {
                Effect::Dir(path) => std::fs::create_dir_all(invocation.cwd.join(path))?,
                Effect::File(path, contents) => {
                    let target = invocation.cwd.join(path);
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(target, contents)?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(invocation.clone());

        let reply = self
            .replies
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.matches(invocation))
            .map(|r| r.value.clone())
            .unwrap_or_else(|| Reply::Output(CommandOutput::ok()));

        match reply {
            Reply::NotFound => Err(PipelineError::Spawn {
                command: invocation.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            }),
            Reply::Output(output) => {
                self.spawned.fetch_add(1, Ordering::SeqCst);
                if output.success() {
                    self.apply_effects(invocation)?;
                }
                Ok(output)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedConfirm
// ---------------------------------------------------------------------------

/// [`Confirm`] that always gives the same answer and counts questions.
#[derive(Debug)]
pub struct ScriptedConfirm {
    answer: bool,
    asked: AtomicUsize,
}

impl ScriptedConfirm {
    pub fn yes() -> Self {
        ScriptedConfirm {
            answer: true,
            asked: AtomicUsize::new(0),
        }
    }

    pub fn no() -> Self {
        ScriptedConfirm {
            answer: false,
            asked: AtomicUsize::new(0),
        }
    }

    /// How many times the operator was asked.
    pub fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

impl Confirm for ScriptedConfirm {
    fn confirm(&self, _question: &str) -> Result<bool> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer)
    }
}
