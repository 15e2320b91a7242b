use sieve_core::config::SieveConfig;
use sieve_core::minimize::{AflCmin, AflTmin};
use sieve_core::pipeline::{Mode, Outcome, PipelineController, PipelineReport};
use sieve_core::process::CancelToken;
use sieve_core::stage::StageInvoker;
use sieve_core::target::TargetCommand;
use sieve_core::verify::ExecCrashVerifier;
use sieve_core::{PipelineError, QueueCollector};

use clap::Parser;
use log::LevelFilter;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

/// Reduces an afl-fuzz corpus: collects queue samples from a sync directory,
/// minimizes them with afl-cmin/afl-tmin and moves crashing samples out of
/// the corpus.
#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about,
    override_usage = "sieve [-c COLLECTION_DIR [--cmin] [--tmin]] [-d] <SYNC_DIR> -- <TARGET_CMD>..."
)]
struct Cli {
    /// Collect all samples from the sync dir into this directory. Existing
    /// files in the collection directory are overwritten.
    #[clap(short, long = "collect", value_name = "COLLECTION_DIR")]
    collection_dir: Option<PathBuf>,
    /// Run afl-cmin on the collection. No effect without --collect.
    #[clap(long)]
    cmin: bool,
    /// Run afl-tmin on the minimized collection if used with --cmin, on the
    /// raw collection otherwise. No effect without --collect.
    #[clap(long)]
    tmin: bool,
    /// Replay the corpus and move crashing samples out of it: the last
    /// collection directory with --collect, every queue in the sync dir otherwise.
    #[clap(short, long)]
    dry_run: bool,
    /// TOML configuration file (defaults to ./sieve.toml when present).
    #[clap(long, value_parser)]
    config: Option<PathBuf>,
    /// Parallel workers for the dry-run.
    #[clap(short = 'j', long)]
    workers: Option<usize>,
    /// Per-sample timeout for the dry-run, in milliseconds.
    #[clap(long)]
    timeout_ms: Option<u64>,
    /// Write a JSON report of the run to this file.
    #[clap(long, value_name = "FILE")]
    report: Option<PathBuf>,
    /// More output; repeat for trace.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Only print warnings and errors.
    #[clap(short, long, conflicts_with = "verbose")]
    quiet: bool,
    /// afl synchronisation directory containing multiple fuzzers and their queues.
    sync_dir: PathBuf,
    /// Target binary and its arguments. Use '@@' for the sample file position.
    #[clap(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
    target_cmd: Vec<String>,
}

impl Cli {
    fn log_level(&self) -> LevelFilter {
        match (self.quiet, self.verbose) {
            (true, _) => LevelFilter::Warn,
            (false, 0) => LevelFilter::Info,
            (false, 1) => LevelFilter::Debug,
            (false, _) => LevelFilter::Trace,
        }
    }
}

fn init_logging(level: LevelFilter) {
    let config = ConfigBuilder::new()
        .set_time_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .build();
    // Ignore the error if a logger is already installed.
    let _ = TermLogger::init(level, config, TerminalMode::Mixed, ColorChoice::Auto);
}

fn load_config(cli: &Cli) -> Result<SieveConfig, anyhow::Error> {
    let mut config = match &cli.config {
        Some(config_path) => {
            log::info!("Loading configuration from {config_path:?}");
            SieveConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = Path::new(SieveConfig::DEFAULT_FILE_NAME);
            if default_config_path.exists() {
                log::info!("Loading default configuration from {default_config_path:?}");
                SieveConfig::load_from_file(default_config_path)?
            } else {
                SieveConfig::default()
            }
        }
    };

    if let Some(workers) = cli.workers {
        config.verify.workers = workers;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.verify.timeout_ms = timeout_ms;
    }
    config.validate()?;
    log::debug!("Effective configuration: {config:#?}");
    Ok(config)
}

fn write_report(path: &Path, report: &PipelineReport) -> Result<(), anyhow::Error> {
    let json = report.to_json()?;
    std::fs::write(path, json)
        .map_err(|e| anyhow::anyhow!("Failed to write report to {:?}: {}", path, e))?;
    log::info!("Report written to {path:?}");
    Ok(())
}

fn summarize(report: &PipelineReport) {
    for stage in &report.stages {
        let location = stage
            .output
            .as_deref()
            .or(stage.input.as_deref())
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        log::info!(
            "{:?}: {} samples ({} failures) {}",
            stage.stage,
            stage.count,
            stage.failures.len(),
            location
        );
    }
    if let Some(corpus) = report.final_corpus() {
        log::info!("Final corpus: {}", corpus.display());
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level());
    log::info!("sieve {}: corpus minimization for afl-fuzz corpora.", env!("CARGO_PKG_VERSION"));

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let target = match TargetCommand::parse(&cli.target_cmd, &config.target.placeholder) {
        Ok(target) => target,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::warn!("Interrupted, stopping after the current sample...");
        handler_token.cancel();
    }) {
        log::warn!("Could not install Ctrl-C handler: {e}");
    }

    let mode = Mode::new(
        cli.sync_dir.clone(),
        cli.collection_dir.clone(),
        cli.cmin,
        cli.tmin,
        cli.dry_run,
    );
    let stages = StageInvoker::new(
        Box::new(AflCmin::new(&config.tools)),
        Box::new(AflTmin::new(&config.tools)),
        Box::new(ExecCrashVerifier::new(&config.verify)),
    );
    let mut controller =
        PipelineController::new(mode, target, Box::new(QueueCollector::new()), stages)
            .with_cancel_token(cancel);

    let report = match controller.run() {
        Ok(report) => report,
        Err(PipelineError::Config(e)) => {
            log::error!("{e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    summarize(&report);
    if let Some(path) = &cli.report {
        if let Err(e) = write_report(path, &report) {
            log::error!("{e}");
        }
    }

    match report.outcome {
        Outcome::Cancelled => ExitCode::from(EXIT_CANCELLED),
        Outcome::NoOp | Outcome::Completed => ExitCode::SUCCESS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_flags_and_trailing_target() {
        let cli = Cli::try_parse_from([
            "sieve", "-c", "out", "--cmin", "--tmin", "-d", "-j", "4", "sync", "--", "./target",
            "-f", "@@",
        ])
        .unwrap();
        assert_eq!(cli.collection_dir, Some(PathBuf::from("out")));
        assert!(cli.cmin && cli.tmin && cli.dry_run);
        assert_eq!(cli.workers, Some(4));
        assert_eq!(cli.sync_dir, PathBuf::from("sync"));
        assert_eq!(cli.target_cmd, ["./target", "-f", "@@"]);
        assert_eq!(cli.log_level(), LevelFilter::Info);
    }

    #[test]
    fn target_is_required() {
        assert!(Cli::try_parse_from(["sieve", "-d", "sync"]).is_err());
    }

    #[test]
    fn verbosity_maps_to_levels() {
        let cli = Cli::try_parse_from(["sieve", "-vv", "sync", "--", "t"]).unwrap();
        assert_eq!(cli.log_level(), LevelFilter::Trace);
        let cli = Cli::try_parse_from(["sieve", "-q", "sync", "--", "t"]).unwrap();
        assert_eq!(cli.log_level(), LevelFilter::Warn);
    }

    #[test]
    fn cli_overrides_config_values() {
        let cli = Cli::try_parse_from([
            "sieve",
            "--config",
            "/nonexistent/sieve.toml",
            "sync",
            "--",
            "t",
        ])
        .unwrap();
        assert!(load_config(&cli).is_err());

        let cli =
            Cli::try_parse_from(["sieve", "-j", "3", "--timeout-ms", "50", "sync", "--", "t"])
                .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.verify.workers, 3);
        assert_eq!(config.verify.timeout_ms, 50);
    }
}
