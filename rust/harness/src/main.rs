//! Klynge CLI
//!
//! Expands a parameter file into a sweep, stages a directory per
//! configuration and runs the jobs locally or submits them to a cluster.

use std::{
    error::Error,
    fmt::Write as _,
    path::PathBuf,
    process::ExitCode,
};

use clap::{Parser, Subcommand};
use klynge_harness::{
    config::HarnessConfig,
    jobfile,
    logging,
    pool::WorkerPool,
    runner::{Dispatch, JobRunner},
    stage::Stager,
};
use klynge_params::ParameterSpace;

#[derive(Parser)]
#[command(name = "klynge", about = "Parameter sweep job orchestration")]
struct Cli {
    /// Show debug output on the console
    #[arg(short, long, global = true)]
    debug: bool,

    /// Full log, truncated on every run
    #[arg(long, global = true, default_value = "log.log")]
    log_file: PathBuf,

    /// Error log, truncated on every run
    #[arg(long, global = true, default_value = "errors.log")]
    error_log: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage and dispatch every configuration
    Run {
        /// Stage directories and write scripts without running or submitting
        #[arg(long)]
        dry_run: bool,

        /// Parameter file, relative to the project root
        #[arg(short, long)]
        config_path: Option<PathBuf>,

        /// Files and directories copied into every job directory
        #[arg(short, long, num_args = 1..)]
        project_paths: Vec<PathBuf>,

        /// Run locally on N cores (all cores if N is omitted) instead of submitting
        #[arg(short = 'j', long, num_args = 0..=1, value_name = "N")]
        cores: Option<Option<usize>>,

        /// Job file (defaults to klynge.toml if present)
        #[arg(long)]
        job: Option<PathBuf>,

        /// Base name for the jobs
        #[arg(long)]
        name: Option<String>,
    },

    /// Print every configuration of a parameter file
    Expand {
        /// Parameter file
        #[arg(short, long)]
        config_path: Option<PathBuf>,

        /// Job file (defaults to klynge.toml if present)
        #[arg(long)]
        job: Option<PathBuf>,
    },

    /// Print the submission script for the job template
    Script {
        /// Job file (defaults to klynge.toml if present)
        #[arg(long)]
        job: Option<PathBuf>,

        /// Base name for the job
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.debug, &cli.log_file, &cli.error_log) {
        eprintln!("ERROR: {e}");
        return ExitCode::FAILURE;
    }

    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        tracing::error!("{info}\n{backtrace}");
    }));

    match execute(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let mut message = e.to_string();
            let mut source = e.source();
            while let Some(cause) = source {
                let _ = write!(message, "\n  caused by: {cause}");
                source = cause.source();
            }
            tracing::error!("{message}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Commands) -> Result<(), Box<dyn Error>> {
    match command {
        Commands::Run {
            dry_run,
            config_path,
            project_paths,
            cores,
            job,
            name,
        } => {
            let mut harness_config = HarnessConfig::discover(job.as_deref())?;
            if let Some(name) = name {
                harness_config.job.name = name;
            }
            let settings = &harness_config.harness;
            let config_path = parameter_file(config_path, settings.config_path.as_ref())?;
            let project_paths = if project_paths.is_empty() {
                settings.project_paths.clone()
            } else {
                project_paths
            };

            let base = std::env::current_dir()?;
            let parameters = settings.parser().parse_file(base.join(&config_path))?;

            let dispatch = match cores {
                Some(Some(n)) => Dispatch::Local(WorkerPool::new(n)?),
                Some(None) => Dispatch::Local(WorkerPool::with_host_cores()),
                None => Dispatch::Remote(jobfile::backend(
                    harness_config.job.profile()?,
                    settings.submit_command.clone(),
                )),
            };
            let stager = Stager::new(&base, &settings.jobdir, config_path, project_paths);

            let mut runner = JobRunner::new(harness_config.job.clone(), stager, dispatch, dry_run);
            let summary = runner.run_to_completion(parameters).await?;

            println!();
            println!("=== Sweep Complete ===");
            println!("Staged: {}", summary.staged);
            println!("Dispatched: {}", summary.dispatched);
            println!("Failed: {}", summary.failed);
        }

        Commands::Expand { config_path, job } => {
            let harness_config = HarnessConfig::discover(job.as_deref())?;
            let settings = &harness_config.harness;
            let config_path = parameter_file(config_path, settings.config_path.as_ref())?;
            let space = ParameterSpace::new(settings.parser().parse_file(&config_path)?);

            let total = space.size().ok_or("parameter space has more configurations than can be counted")?;
            println!("=== {total} configurations ===");
            for (key, values) in space.swept() {
                println!("  {key}: {} values", values.len());
            }
            for config in &space {
                println!();
                println!("[{}]", config.index());
                print!("{}", config.render());
            }
        }

        Commands::Script { job, name } => {
            let mut harness_config = HarnessConfig::discover(job.as_deref())?;
            if let Some(name) = name {
                harness_config.job.name = name;
            }
            let backend = jobfile::backend(
                harness_config.job.profile()?,
                harness_config.harness.submit_command.clone(),
            );
            print!("{}", backend.render(&harness_config.job));
        }
    }

    Ok(())
}

/// Parameter file from the command line, else from the job file.
fn parameter_file(cli: Option<PathBuf>, configured: Option<&PathBuf>) -> Result<PathBuf, Box<dyn Error>> {
    cli.or_else(|| configured.cloned())
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| "no parameter file: pass --config-path or set harness.config_path".into())
}
