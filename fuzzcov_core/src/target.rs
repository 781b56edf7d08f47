//! Replay of a single fuzz target.
//!
//! The fast path runs the whole corpus in one process and merges whatever
//! fragments it left. Corpora often hold at least one crashing input, which
//! kills that single process before it flushes coverage, so when the fast path
//! yields nothing the target is replayed one corpus file at a time and the
//! surviving fragments are folded into an accumulating profile.

use crate::config::ReplaySettings;
use crate::fragments::{FragmentPattern, PROFILE_FILE_ENV};
use crate::merger::{MergeError, ProfileMerger};
use crate::plan::{CorpusSelector, TargetPlan};
use crate::process::{CommandRunner, RunOutcome};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    #[error("no usable coverage profiles were produced")]
    NoUsableProfiles,
    #[error("corpus has no files to replay individually")]
    NoCorpusMembers,
    #[error("accumulating merge failed: {0}")]
    FallbackMergeFailed(MergeError),
    #[error("run was cancelled")]
    Cancelled,
    /// Anything the executor did not anticipate (I/O trouble, a panic).
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The plan's merged profile exists and is non-empty.
    Verified,
    Failed(FailureReason),
}

impl ExecutionOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, ExecutionOutcome::Verified)
    }
}

/// Errors that escape a target's replay. The scheduler records them as a
/// failed target; they never abort other targets.
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

fn io_context(context: impl Into<String>) -> impl FnOnce(io::Error) -> TargetError {
    let context = context.into();
    move |source| TargetError::Io { context, source }
}

/// Turns one [`TargetPlan`] into exactly one [`ExecutionOutcome`].
pub trait PlanExecutor: Send + Sync {
    fn execute(&self, plan: &TargetPlan) -> Result<ExecutionOutcome, TargetError>;
}

enum Fallback {
    Accumulated(usize),
    MergeFailed(MergeError),
    NoMembers,
    Cancelled(usize),
}

pub struct TargetExecutor<R: CommandRunner, M: ProfileMerger> {
    runner: R,
    merger: M,
    settings: ReplaySettings,
}

impl<R: CommandRunner, M: ProfileMerger> TargetExecutor<R, M> {
    pub fn new(runner: R, merger: M, settings: ReplaySettings) -> Self {
        Self {
            runner,
            merger,
            settings,
        }
    }

    pub fn settings(&self) -> &ReplaySettings {
        &self.settings
    }

    fn env_for(&self, plan: &TargetPlan, pattern: &FragmentPattern) -> BTreeMap<String, String> {
        let mut env = plan.env.clone();
        env.insert(PROFILE_FILE_ENV.to_string(), pattern.env_value());
        env
    }

    /// Returns whether the whole-corpus fragments merged into the plan's
    /// profile, and whether the run was cancelled.
    fn replay_whole_corpus(&self, plan: &TargetPlan) -> Result<(bool, bool), TargetError> {
        let pattern = FragmentPattern::new(&plan.fragment_dir(), &plan.name);
        let env = self.env_for(plan, &pattern);
        pattern
            .erase()
            .map_err(io_context(format!("erasing stale fragments for {}", plan.name)))?;

        let mut cancelled = false;
        if plan.corpus_selector == CorpusSelector::None {
            let outcome = self.runner.run(
                &plan.command,
                &env,
                self.settings.whole_corpus_timeout(),
                "no corpus",
            );
            cancelled = outcome == RunOutcome::Cancelled;
        } else {
            let mut command = plan.command.clone();
            command.extend(plan.whole_corpus_args());
            for attempt in 0..self.settings.whole_corpus_retries {
                let outcome = self.runner.run(
                    &command,
                    &env,
                    self.settings.whole_corpus_timeout(),
                    &format!("full corpus attempt {attempt}"),
                );
                match outcome {
                    RunOutcome::Success => break,
                    RunOutcome::Cancelled => {
                        cancelled = true;
                        break;
                    }
                    _ => {}
                }
            }
        }

        // A multi-process target (e.g. a wrapper executable) leaves one
        // fragment per process.
        let fragments = pattern
            .usable()
            .map_err(io_context(format!("listing fragments for {}", plan.name)))?;
        let merged = match self.merger.merge(&fragments, &plan.profile_path) {
            Ok(()) => true,
            Err(e) => {
                debug!(target_name = %plan.name, error = %e, "whole corpus produced no profile");
                // A tool that "succeeded" with an empty output must not seed
                // the accumulating profile.
                self.remove_stale_profile(plan)?;
                false
            }
        };
        Ok((merged, cancelled))
    }

    fn replay_individually(&self, plan: &TargetPlan) -> Result<Fallback, TargetError> {
        let members = plan
            .corpus_members()
            .map_err(io_context(format!("listing corpus for {}", plan.name)))?;
        let Some(corpus_dir) = plan.corpus_dir.as_ref() else {
            return Ok(Fallback::NoMembers);
        };
        if members.is_empty() {
            return Ok(Fallback::NoMembers);
        }
        info!(
            target_name = %plan.name,
            corpus_files = members.len(),
            "whole corpus run produced no coverage, replaying test cases individually"
        );

        let fragment_dir = plan.fragment_dir();
        let accumulated = fragment_dir.join(format!("{}_accumulated.profraw", plan.name));
        let max_to_try = self.settings.individual_testcases_max_to_try;
        let successes_needed = self.settings.individual_testcases_successes_needed;
        let mut valid_profiles = 0;

        for (index, member) in members.iter().enumerate() {
            if index >= max_to_try {
                info!(
                    target_name = %plan.name,
                    "Skipping remaining test cases for {} - >{} tried",
                    plan.name,
                    max_to_try
                );
                break;
            }

            let pattern = FragmentPattern::new(&fragment_dir, &format!("{}_{index}", plan.name));
            let env = self.env_for(plan, &pattern);
            pattern
                .erase()
                .map_err(io_context(format!("erasing stale fragments for {}", plan.name)))?;

            let mut command = plan.command.clone();
            command.push(corpus_dir.join(member).to_string_lossy().into_owned());
            let outcome = self.runner.run(
                &command,
                &env,
                self.settings.individual_testcase_timeout(),
                &format!("specific test case {index}"),
            );

            let mut fragments = pattern
                .usable()
                .map_err(io_context(format!("listing fragments for {}", plan.name)))?;
            if fragments.is_empty() {
                // Drop zero-byte leftovers so they do not pile up.
                pattern
                    .erase()
                    .map_err(io_context(format!("erasing empty fragments for {}", plan.name)))?;
            } else {
                valid_profiles += 1;
                if plan.profile_path.exists() {
                    fs::rename(&plan.profile_path, &accumulated).map_err(io_context(format!(
                        "moving accumulated profile for {}",
                        plan.name
                    )))?;
                    fragments.push(accumulated.clone());
                }
                if let Err(e) = self.merger.merge(&fragments, &plan.profile_path) {
                    warn!(
                        target_name = %plan.name,
                        test_case = index,
                        error = %e,
                        "profdata merge failed, treating this target as failed"
                    );
                    return Ok(Fallback::MergeFailed(e));
                }
            }

            if outcome == RunOutcome::Cancelled {
                return Ok(Fallback::Cancelled(valid_profiles));
            }
            if valid_profiles > successes_needed {
                info!(
                    target_name = %plan.name,
                    "Skipping remaining test cases for {}, >{} valid profiles recorded",
                    plan.name,
                    successes_needed
                );
                break;
            }
        }
        Ok(Fallback::Accumulated(valid_profiles))
    }

    fn remove_stale_profile(&self, plan: &TargetPlan) -> Result<(), TargetError> {
        match fs::remove_file(&plan.profile_path) {
            Ok(()) => {
                debug!(path = %plan.profile_path.display(), "removed stale profile");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_context(format!("removing stale profile for {}", plan.name))(e)),
        }
    }
}

impl<R: CommandRunner, M: ProfileMerger> PlanExecutor for TargetExecutor<R, M> {
    fn execute(&self, plan: &TargetPlan) -> Result<ExecutionOutcome, TargetError> {
        let fragment_dir = plan.fragment_dir();
        fs::create_dir_all(&fragment_dir)
            .map_err(io_context(format!("creating {}", fragment_dir.display())))?;
        let outcome = self.replay(plan);
        // Only succeeds once every fragment has been consumed or erased.
        if let Err(e) = fs::remove_dir(&fragment_dir) {
            debug!(path = %fragment_dir.display(), error = %e, "fragment directory left in place");
        }
        outcome
    }
}

impl<R: CommandRunner, M: ProfileMerger> TargetExecutor<R, M> {
    fn replay(&self, plan: &TargetPlan) -> Result<ExecutionOutcome, TargetError> {
        self.remove_stale_profile(plan)?;

        let (merged, cancelled) = self.replay_whole_corpus(plan)?;
        if merged {
            return Ok(ExecutionOutcome::Verified);
        }
        if cancelled {
            return Ok(ExecutionOutcome::Failed(FailureReason::Cancelled));
        }
        if plan.corpus_selector == CorpusSelector::None {
            return Ok(ExecutionOutcome::Failed(FailureReason::NoUsableProfiles));
        }

        let outcome = match self.replay_individually(plan)? {
            Fallback::Accumulated(0) => ExecutionOutcome::Failed(FailureReason::NoUsableProfiles),
            Fallback::Accumulated(_) | Fallback::Cancelled(1..) => ExecutionOutcome::Verified,
            Fallback::Cancelled(_) => ExecutionOutcome::Failed(FailureReason::Cancelled),
            Fallback::MergeFailed(e) => {
                ExecutionOutcome::Failed(FailureReason::FallbackMergeFailed(e))
            }
            Fallback::NoMembers => ExecutionOutcome::Failed(FailureReason::NoCorpusMembers),
        };
        Ok(outcome)
    }
}
