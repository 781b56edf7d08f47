use fuzzcov_core::config::HarnessConfig;
use fuzzcov_core::driver::{FuzzerFamily, HarnessDriver, HarnessError, HarnessInputs};

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Run all fuzz targets that have corresponding corpora, then save the merged
/// coverage profiles.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory where the fuzzer binaries have been built.
    #[arg(long)]
    fuzzer_binaries_dir: PathBuf,
    /// Directory into which corpora have been downloaded.
    #[arg(long)]
    fuzzer_corpora_dir: PathBuf,
    /// Directory where profdata will be stored.
    #[arg(long)]
    profdata_outdir: PathBuf,
    /// The type of fuzzer tests to run.
    #[arg(long, value_enum, default_value_t = FuzzerArg::Libfuzzer)]
    fuzzer: FuzzerArg,
    #[arg(short, long)]
    config_file: Option<PathBuf>,
    /// Worker count; defaults to the number of CPUs.
    #[arg(short, long)]
    jobs: Option<usize>,
    #[arg(long)]
    report_dir: Option<PathBuf>,
    #[arg(long)]
    merge_tool: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FuzzerArg {
    Libfuzzer,
    Centipede,
    Fuzzilli,
}

impl From<FuzzerArg> for FuzzerFamily {
    fn from(arg: FuzzerArg) -> Self {
        match arg {
            FuzzerArg::Libfuzzer => FuzzerFamily::Libfuzzer,
            FuzzerArg::Centipede => FuzzerFamily::Centipede,
            FuzzerArg::Fuzzilli => FuzzerFamily::Fuzzilli,
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("fuzzcov_core={level},fuzzcov={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<HarnessConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            HarnessConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("fuzzcov.toml");
            if default_config_path.exists() {
                info!("No config file specified via CLI, loading default: {default_config_path:?}");
                HarnessConfig::load_from_file(&default_config_path)?
            } else {
                HarnessConfig::default()
            }
        }
    };

    if let Some(jobs) = cli.jobs {
        config.harness.parallelism = Some(jobs);
    }
    if let Some(report_dir) = &cli.report_dir {
        config.harness.report_dir = report_dir.clone();
    }
    if let Some(merge_tool) = &cli.merge_tool {
        config.harness.merge_tool = merge_tool.clone();
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<(), anyhow::Error> {
    let config = load_config(&cli)?;
    info!("Effective configuration: {config:?}");

    let inputs = HarnessInputs {
        binaries_dir: cli.fuzzer_binaries_dir,
        corpora_dir: cli.fuzzer_corpora_dir,
        output_dir: cli.profdata_outdir,
        family: cli.fuzzer.into(),
    };
    let summary = HarnessDriver::new(config).run(&inputs)?;

    summary.write_to(&mut std::io::stdout().lock())?;
    info!(
        copied = summary.copied.len(),
        copy_failures = summary.copy_failures.len(),
        "Finished copying profiles to {:?}",
        inputs.output_dir
    );
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            let code = e
                .downcast_ref::<HarnessError>()
                .map_or(1, HarnessError::exit_code);
            ExitCode::from(code as u8)
        }
    }
}
