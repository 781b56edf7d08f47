use crate::process::{CommandRunner, RunOutcome};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a merge did not produce a usable profile.
///
/// Every variant is a soft failure: the caller decides whether the target can
/// still be rescued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// Nothing to merge; the tool is not invoked and no output is written.
    #[error("no input fragments to merge")]
    NoInputs,
    /// The merge tool could not be started.
    #[error("merge tool unavailable: {0}")]
    ToolUnavailable(String),
    /// The merge tool ran and rejected its inputs.
    #[error("merge tool failed: {0}")]
    ToolFailed(String),
    #[error("merge tool timed out after {0:?}")]
    TimedOut(Duration),
    #[error("merge cancelled")]
    Cancelled,
    /// The tool reported success but left no profile behind.
    #[error("merge produced no output at {0:?}")]
    EmptyOutput(PathBuf),
}

/// Combines raw fragments (and previously merged profiles) into one profile.
///
/// Inputs are consumed: every input path is removed once the attempt is over,
/// whether it worked or not.
pub trait ProfileMerger: Send + Sync {
    fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError>;
}

/// [`ProfileMerger`] driving `llvm-profdata merge -sparse`.
pub struct LlvmProfdataMerger<R: CommandRunner> {
    tool: PathBuf,
    runner: R,
    timeout: Duration,
}

impl<R: CommandRunner> LlvmProfdataMerger<R> {
    pub fn new(tool: PathBuf, runner: R, timeout: Duration) -> Self {
        Self {
            tool,
            runner,
            timeout,
        }
    }

    pub fn tool(&self) -> &Path {
        &self.tool
    }

    fn command_line(&self, inputs: &[PathBuf], output: &Path) -> Vec<String> {
        let mut cmd = vec![
            self.tool.to_string_lossy().into_owned(),
            "merge".to_string(),
            "-sparse".to_string(),
        ];
        cmd.extend(inputs.iter().map(|p| p.to_string_lossy().into_owned()));
        cmd.push("-o".to_string());
        cmd.push(output.to_string_lossy().into_owned());
        cmd
    }

    fn invoke(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError> {
        let cmd = self.command_line(inputs, output);
        let annotation = format!("merging {} profile(s)", inputs.len());
        match self
            .runner
            .run(&cmd, &BTreeMap::new(), self.timeout, &annotation)
        {
            RunOutcome::Success => {}
            RunOutcome::NonZeroExit(out) => {
                return Err(MergeError::ToolFailed(format!(
                    "{}: {}",
                    out.describe(),
                    String::from_utf8_lossy(&out.stderr).trim()
                )));
            }
            RunOutcome::LaunchFailed(reason) => return Err(MergeError::ToolUnavailable(reason)),
            RunOutcome::TimedOut(after) => return Err(MergeError::TimedOut(after)),
            RunOutcome::Cancelled => return Err(MergeError::Cancelled),
        }
        match fs::metadata(output) {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(MergeError::EmptyOutput(output.to_path_buf())),
        }
    }
}

impl<R: CommandRunner> ProfileMerger for LlvmProfdataMerger<R> {
    fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError> {
        if inputs.is_empty() {
            return Err(MergeError::NoInputs);
        }
        let result = self.invoke(inputs, output);
        remove_inputs(inputs);
        match &result {
            Ok(()) => debug!(output = %output.display(), inputs = inputs.len(), "merged profiles"),
            Err(e) => warn!(output = %output.display(), error = %e, "profile merge failed"),
        }
        result
    }
}

fn remove_inputs(inputs: &[PathBuf]) {
    for input in inputs {
        match fs::remove_file(input) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %input.display(), error = %e, "failed to remove consumed profile"),
        }
    }
}
