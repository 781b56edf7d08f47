use crate::config::HarnessConfig;
use crate::merger::LlvmProfdataMerger;
use crate::plan::{CorpusSelector, TargetPlan, profile_path_for};
use crate::process::ProcessRunner;
use crate::scheduler::{HarnessResult, Scheduler};
use crate::target::TargetExecutor;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Display value that makes the cold-start binary bail out right after
/// startup.
pub const BOGUS_DISPLAY: &str = "not-a-real-display";

const FUZZILLI_BINARY: &str = "d8";

/// Setup problems that stop a run before any target is scheduled.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("No valid llvm_profdata at {0:?}")]
    MergeToolMissing(PathBuf),
    #[error("{0:?} does not exist or is not a directory")]
    OutputDirInvalid(PathBuf),
    #[error("Cannot create report directory {path:?}: {source}")]
    ReportDirUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Cannot read fuzzer corpora directory {path:?}: {source}")]
    CorporaUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl HarnessError {
    pub fn exit_code(&self) -> i32 {
        2
    }
}

/// Corpus layout and binary naming convention of the fuzz targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzerFamily {
    /// `<binaries>/<name>` replayed against `<corpora>/<name>/`.
    Libfuzzer,
    /// Same layout as libFuzzer.
    Centipede,
    /// One `d8` binary; `<corpora>/<dir>/fuzzdir/` holds settings and `.js` files.
    Fuzzilli,
}

/// Where the run reads binaries and corpora from and where it publishes
/// verified profiles.
#[derive(Debug, Clone)]
pub struct HarnessInputs {
    pub binaries_dir: PathBuf,
    pub corpora_dir: PathBuf,
    pub output_dir: PathBuf,
    pub family: FuzzerFamily,
}

#[derive(Debug, Default, Clone)]
pub struct DiscoveredTargets {
    pub plans: Vec<TargetPlan>,
    /// Targets that were found but could not be planned.
    pub incomplete: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub result: HarnessResult,
    pub incomplete: Vec<String>,
    pub copied: Vec<PathBuf>,
    pub copy_failures: Vec<(String, String)>,
}

impl RunSummary {
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "Successful targets: {:?}", self.result.verified_names())?;
        writeln!(out, "Failed targets: {:?}", self.result.failed_names())?;
        Ok(())
    }
}

#[derive(Deserialize, Debug)]
struct FuzzilliSettings {
    #[serde(rename = "processArguments")]
    process_arguments: Vec<String>,
}

/// Builds the target list, runs it and publishes verified profiles.
pub struct HarnessDriver {
    config: HarnessConfig,
    scheduler: Scheduler,
}

impl HarnessDriver {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            scheduler: Scheduler::default(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Checks everything that would make the whole run pointless.
    pub fn validate(&self, inputs: &HarnessInputs) -> Result<(), HarnessError> {
        let harness = &self.config.harness;
        if !harness.merge_tool.is_file() {
            return Err(HarnessError::MergeToolMissing(harness.merge_tool.clone()));
        }
        if !inputs.output_dir.is_dir() {
            return Err(HarnessError::OutputDirInvalid(inputs.output_dir.clone()));
        }
        fs::create_dir_all(&harness.report_dir).map_err(|source| {
            HarnessError::ReportDirUnavailable {
                path: harness.report_dir.clone(),
                source,
            }
        })
    }

    pub fn build_plans(&self, inputs: &HarnessInputs) -> Result<DiscoveredTargets, HarnessError> {
        let mut discovered = match inputs.family {
            FuzzerFamily::Libfuzzer | FuzzerFamily::Centipede => self.libfuzzer_plans(inputs)?,
            FuzzerFamily::Fuzzilli => self.fuzzilli_plans(inputs)?,
        };

        let mut seen = HashSet::new();
        discovered.plans.retain(|plan| {
            let fresh = seen.insert(plan.name.clone());
            if !fresh {
                warn!(target_name = %plan.name, "dropping plan with duplicate target name");
            }
            fresh
        });
        info!(
            "Incomplete targets (couldn't find binary): {:?}",
            discovered.incomplete
        );
        Ok(discovered)
    }

    fn libfuzzer_plans(&self, inputs: &HarnessInputs) -> Result<DiscoveredTargets, HarnessError> {
        let report_dir = &self.config.harness.report_dir;
        let mut discovered = DiscoveredTargets::default();

        for name in sorted_entries(&inputs.corpora_dir)? {
            let binary = inputs.binaries_dir.join(&name);
            let corpus = inputs.corpora_dir.join(&name);
            if !(binary.is_file() && is_non_empty_dir(&corpus)) {
                warn!(
                    "Could not find binary file for {}, or, the provided corpora path is not a non-empty directory",
                    name
                );
                discovered.incomplete.push(name);
                continue;
            }
            let command = vec![
                binary.to_string_lossy().into_owned(),
                "-runs=0".to_string(),
                format!("-rss_limit_mb={}", self.config.harness.rss_limit_mb),
            ];
            discovered.plans.push(
                TargetPlan::new(name, command, report_dir).with_corpus(corpus, CorpusSelector::All),
            );
        }

        if let Some(plan) = self.cold_start_plan(inputs) {
            discovered.plans.push(plan);
        }
        Ok(discovered)
    }

    /// Running the main binary without a usable display exercises almost
    /// nothing, but it makes every instrumented file show up in the report
    /// with zero counts instead of being missing.
    fn cold_start_plan(&self, inputs: &HarnessInputs) -> Option<TargetPlan> {
        let name = &self.config.harness.cold_start_binary;
        let binary = inputs.binaries_dir.join(name);
        if !binary.is_file() {
            warn!("Could not find binary file for {} itself", name);
            return None;
        }
        Some(
            TargetPlan::new(
                name.clone(),
                vec![binary.to_string_lossy().into_owned()],
                &self.config.harness.report_dir,
            )
            .with_env("DISPLAY", BOGUS_DISPLAY),
        )
    }

    fn fuzzilli_plans(&self, inputs: &HarnessInputs) -> Result<DiscoveredTargets, HarnessError> {
        let mut discovered = DiscoveredTargets::default();
        let binary = inputs.binaries_dir.join(FUZZILLI_BINARY);
        if !binary.is_file() {
            warn!("Could not find binary file: {:?}", binary);
            return Ok(discovered);
        }
        let chunk_size = self.config.harness.fuzzilli_files_per_chunk.max(1);

        for dir_name in sorted_entries(&inputs.corpora_dir)? {
            let fuzzdir = inputs.corpora_dir.join(&dir_name).join("fuzzdir");
            if !inputs.corpora_dir.join(&dir_name).is_dir() {
                continue;
            }
            let settings = match read_fuzzilli_settings(&fuzzdir.join("settings.json")) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!(corpus = %dir_name, error = %e, "skipping fuzzilli corpus without usable settings");
                    discovered.incomplete.push(dir_name);
                    continue;
                }
            };
            let js_dir = fuzzdir.join("corpus");
            let js_files = match js_files(&js_dir) {
                Ok(files) => files,
                Err(e) => {
                    warn!(corpus = %dir_name, error = %e, "cannot list fuzzilli corpus");
                    discovered.incomplete.push(dir_name);
                    continue;
                }
            };

            let mut command = vec![binary.to_string_lossy().into_owned()];
            command.extend(settings.process_arguments);
            for (i, chunk) in js_files.chunks(chunk_size).enumerate() {
                discovered.plans.push(
                    TargetPlan::new(
                        format!("{dir_name}_{i}"),
                        command.clone(),
                        &self.config.harness.report_dir,
                    )
                    .with_corpus(js_dir.clone(), CorpusSelector::Subset(chunk.to_vec())),
                );
            }
        }
        Ok(discovered)
    }

    /// Validates, plans, runs every target and copies verified profiles out.
    pub fn run(&self, inputs: &HarnessInputs) -> Result<RunSummary, HarnessError> {
        self.validate(inputs)?;
        let discovered = self.build_plans(inputs)?;

        let harness = &self.config.harness;
        let runner = ProcessRunner::new(self.scheduler.cancel_token().clone());
        let merger =
            LlvmProfdataMerger::new(harness.merge_tool.clone(), runner.clone(), harness.merge_timeout());
        let executor = TargetExecutor::new(runner, merger, self.config.replay.clone());
        let parallelism = harness
            .parallelism
            .unwrap_or_else(Scheduler::default_parallelism);

        let result = self.scheduler.run(&executor, &discovered.plans, parallelism);

        info!(
            "Finished getting coverage information. Copying to {:?}",
            inputs.output_dir
        );
        let (copied, copy_failures) = self.copy_verified(&result, &inputs.output_dir);
        Ok(RunSummary {
            result,
            incomplete: discovered.incomplete,
            copied,
            copy_failures,
        })
    }

    /// Copies each verified profile into `output_dir`. A failed copy is
    /// reported but does not stop the others.
    pub fn copy_verified(
        &self,
        result: &HarnessResult,
        output_dir: &Path,
    ) -> (Vec<PathBuf>, Vec<(String, String)>) {
        let mut copied = Vec::new();
        let mut failures = Vec::new();
        for name in &result.verified {
            let source = profile_path_for(&self.config.harness.report_dir, name);
            let destination = profile_path_for(output_dir, name);
            info!(from = %source.display(), to = %destination.display(), "copying profile");
            match fs::copy(&source, &destination) {
                Ok(_) => copied.push(destination),
                Err(e) => {
                    warn!("Warning: failed to copy profdata for {}: {}", name, e);
                    failures.push((name.clone(), e.to_string()));
                }
            }
        }
        (copied, failures)
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<String>, HarnessError> {
    let unreadable = |source| HarnessError::CorporaUnreadable {
        path: dir.to_path_buf(),
        source,
    };
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

fn is_non_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn read_fuzzilli_settings(path: &Path) -> Result<FuzzilliSettings, anyhow::Error> {
    let content = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read settings at {:?}: {}", path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse settings JSON {:?}: {}", path, e))
}

fn js_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.ends_with(".js") {
            files.push(name);
        }
    }
    files.sort();
    Ok(files)
}
