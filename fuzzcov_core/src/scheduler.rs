use crate::plan::TargetPlan;
use crate::process::CancelToken;
use crate::target::{ExecutionOutcome, FailureReason, PlanExecutor};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use tracing::{error, info};

/// Final tally of a harness run.
///
/// A target name appears in exactly one of `verified` and `failed`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HarnessResult {
    pub verified: BTreeSet<String>,
    pub failed: BTreeMap<String, FailureReason>,
}

impl HarnessResult {
    pub fn record(&mut self, name: &str, outcome: ExecutionOutcome) {
        match outcome {
            ExecutionOutcome::Verified => {
                self.failed.remove(name);
                self.verified.insert(name.to_string());
            }
            ExecutionOutcome::Failed(reason) => {
                self.verified.remove(name);
                self.failed.insert(name.to_string(), reason);
            }
        }
    }

    pub fn completed(&self) -> usize {
        self.verified.len() + self.failed.len()
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.failed.keys().map(String::as_str).collect()
    }

    pub fn verified_names(&self) -> Vec<&str> {
        self.verified.iter().map(String::as_str).collect()
    }
}

/// Fans target plans out over a fixed number of worker threads.
///
/// Workers claim plans through a shared index and send each outcome back over
/// a channel; the calling thread is the only owner of the [`HarnessResult`].
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    cancel: CancelToken,
}

impl Scheduler {
    pub fn new(cancel: CancelToken) -> Self {
        Self { cancel }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// One worker per CPU the process may run on.
    pub fn default_parallelism() -> usize {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Runs every plan and waits for all of them. Plan names must be unique.
    pub fn run<E: PlanExecutor>(
        &self,
        executor: &E,
        plans: &[TargetPlan],
        parallelism: usize,
    ) -> HarnessResult {
        let total = plans.len();
        let workers = parallelism.max(1).min(total.max(1));
        info!("Running {} fuzzers across {} workers", total, workers);

        let next_plan = AtomicUsize::new(0);
        let mut reported = vec![false; total];
        let mut result = HarnessResult::default();

        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel::<(usize, ExecutionOutcome)>();
            for worker in 0..workers {
                let tx = tx.clone();
                let next_plan = &next_plan;
                let spawned = thread::Builder::new()
                    .name(format!("fuzzcov-worker-{worker}"))
                    .spawn_scoped(scope, move || {
                        loop {
                            let index = next_plan.fetch_add(1, Ordering::SeqCst);
                            let Some(plan) = plans.get(index) else {
                                break;
                            };
                            let outcome = self.execute_one(executor, plan);
                            if tx.send((index, outcome)).is_err() {
                                break;
                            }
                        }
                    });
                if let Err(e) = spawned {
                    error!(worker, error = %e, "failed to spawn worker thread");
                }
            }
            drop(tx);

            for (index, outcome) in rx {
                let name = &plans[index].name;
                reported[index] = true;
                let verified = outcome.is_verified();
                result.record(name, outcome);
                info!(
                    target_name = %name,
                    verified,
                    "Finishing target {} (completed {}/{}, of which {} succeeded)",
                    name,
                    result.completed(),
                    total,
                    result.verified.len()
                );
            }
        });

        for (plan, _) in plans.iter().zip(&reported).filter(|(_, done)| !**done) {
            error!(target_name = %plan.name, "target was never executed");
            result.record(
                &plan.name,
                ExecutionOutcome::Failed(FailureReason::Unexpected(
                    "no worker picked up this target".to_string(),
                )),
            );
        }
        result
    }

    fn execute_one<E: PlanExecutor>(&self, executor: &E, plan: &TargetPlan) -> ExecutionOutcome {
        if self.cancel.is_cancelled() {
            return ExecutionOutcome::Failed(FailureReason::Cancelled);
        }
        info!(target_name = %plan.name, "Starting target {}", plan.name);

        match catch_unwind(AssertUnwindSafe(|| executor.execute(plan))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(target_name = %plan.name, error = %e, "target failed unexpectedly");
                ExecutionOutcome::Failed(FailureReason::Unexpected(e.to_string()))
            }
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic type".to_string()
                };
                error!(target_name = %plan.name, panic = %msg, "target executor panicked");
                ExecutionOutcome::Failed(FailureReason::Unexpected(format!("panicked: {msg}")))
            }
        }
    }
}
