pub mod config;
pub mod driver;
pub mod fragments;
pub mod merger;
pub mod plan;
pub mod process;
pub mod scheduler;
pub mod target;

#[cfg(all(test, unix))]
#[path = "../tests/common/mod.rs"]
mod test_support;

pub use config::{HarnessConfig, HarnessSettings, ReplaySettings};
pub use driver::{DiscoveredTargets, FuzzerFamily, HarnessDriver, HarnessError, HarnessInputs, RunSummary};
pub use fragments::FragmentPattern;
pub use merger::{LlvmProfdataMerger, MergeError, ProfileMerger};
pub use plan::{CorpusSelector, TargetPlan};
pub use process::{CancelToken, CommandRunner, ProcessOutput, ProcessRunner, RunOutcome};
pub use scheduler::{HarnessResult, Scheduler};
pub use target::{ExecutionOutcome, FailureReason, PlanExecutor, TargetError, TargetExecutor};
