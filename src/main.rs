//! tmflow CLI Entry Point
//!
//! Validates a workflow description and submits its job tree.
//!
//! # Usage
//!
//! ```bash
//! # Submit a workflow
//! tmflow workflow.yaml --workflow-dir /data/experiment --user alice
//!
//! # Only check the description
//! tmflow workflow.yaml --validate-only
//!
//! # Dry run mode (preview jobs)
//! tmflow workflow.yaml --dry-run
//!
//! # Cancel a running submission by creating a file
//! tmflow workflow.yaml --cancel-file /tmp/tmflow.cancel
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use chrono::Local;
use colored::Colorize;
use log::{error, info, warn};

use tmflow::config::{BackendKind, EngineConfig};
use tmflow::error::SubmissionError;
use tmflow::execution::{
    CancelToken, ClusterBackend, DryRunBackend, LocalBackend, SlurmAdapter,
    SlurmBackend, SubmissionEngine, SubmissionReport,
};
use tmflow::jobs::{
    Composer, ManifestPlanner, RunPlan, StaticPlanner, StepPlanner, SubmissionContext, Task,
    WorkflowJobCollection,
};
use tmflow::workflow::load_description;
use tmflow::{APP_NAME, VERSION};

/// Default workflow description used when none is specified.
const DEFAULT_DESCRIPTION: &str = "workflow.yaml";

/// Interval for checking the cancel file.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Command-line options parsed from arguments.
#[derive(Debug)]
struct Cli {
    description_path: String,
    config_path: Option<PathBuf>,
    workflow_dir: Option<PathBuf>,
    user_name: Option<String>,
    submission_id: Option<u64>,
    dry_run: bool,
    validate_only: bool,
    max_attempts: Option<u32>,
    slurm: bool,
    cancel_file: Option<PathBuf>,
    verbose: bool,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            description_path: DEFAULT_DESCRIPTION.to_string(),
            config_path: None,
            workflow_dir: None,
            user_name: None,
            submission_id: None,
            dry_run: false,
            validate_only: false,
            max_attempts: None,
            slurm: false,
            cancel_file: None,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Workflow job-tree compiler and submission engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: tmflow [OPTIONS] <DESCRIPTION>");
    println!();
    println!("Arguments:");
    println!("  <DESCRIPTION>          Path to workflow description (YAML or JSON)");
    println!();
    println!("Options:");
    println!("  --config FILE          Engine configuration (YAML)");
    println!("  --workflow-dir DIR     Directory for logs, batches and reports (default: .)");
    println!("  --user NAME            Submitting user, used as accounting identity");
    println!("  --submission-id N      Submission identifier (default: current timestamp)");
    println!("  --max-attempts N       Total submissions per job, including the first");
    println!("  --slurm                Submit jobs to Slurm (sbatch/sacct/scancel)");
    println!("  --cancel-file PATH     Cancel the submission when PATH appears");
    println!("  --dry-run              Preview jobs without execution");
    println!("  --validate-only        Validate the description and exit");
    println!("  --verbose              Enable debug logging");
    println!("  --help                 Show this help message");
    println!("  --version              Show version information");
    println!();
    println!("Examples:");
    println!("  tmflow workflow.yaml --validate-only");
    println!("  tmflow workflow.yaml --workflow-dir /data/experiment --user alice");
}

fn option_value<'a>(args: &'a [String], i: usize, option: &str) -> Result<&'a String, String> {
    args.get(i)
        .ok_or_else(|| format!("{} requires an argument", option))
}

/// Parses command-line arguments into a Cli struct.
fn parse_arguments(args: &[String]) -> Result<Cli, String> {
    let mut cli = Cli::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => cli.dry_run = true,
            "--validate-only" => cli.validate_only = true,
            "--slurm" => cli.slurm = true,
            "--verbose" | "-v" => cli.verbose = true,
            "--config" => {
                i += 1;
                cli.config_path = Some(PathBuf::from(option_value(args, i, arg)?));
            }
            "--workflow-dir" => {
                i += 1;
                cli.workflow_dir = Some(PathBuf::from(option_value(args, i, arg)?));
            }
            "--cancel-file" => {
                i += 1;
                cli.cancel_file = Some(PathBuf::from(option_value(args, i, arg)?));
            }
            "--user" => {
                i += 1;
                cli.user_name = Some(option_value(args, i, arg)?.clone());
            }
            "--submission-id" => {
                i += 1;
                let value = option_value(args, i, arg)?;
                cli.submission_id = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid submission id: {}", value))?,
                );
            }
            "--max-attempts" => {
                i += 1;
                let value = option_value(args, i, arg)?;
                cli.max_attempts = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid max attempts value: {}", value))?,
                );
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                match positional_index {
                    0 => cli.description_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(cli)
}

/// Loads the engine configuration and applies command-line overrides.
fn engine_config(cli: &Cli) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if cli.dry_run {
        config.backend = BackendKind::DryRun;
    } else if cli.slurm {
        config.backend = BackendKind::Slurm;
    }
    if let Some(max_attempts) = cli.max_attempts {
        config.max_attempts = max_attempts;
    }
    config.validate()?;
    Ok(config)
}

/// Starts a thread that cancels the submission once `path` exists.
fn watch_cancel_file(path: PathBuf, token: CancelToken) {
    info!("Cancel control: {}", path.display());
    thread::spawn(move || {
        while !path.exists() {
            thread::sleep(CANCEL_CHECK_INTERVAL);
        }
        warn!("Cancel file found: {}", path.display());
        token.cancel();
    });
}

/// Whether descriptors and the submission report go to disk.
fn writes_artifacts(config: &EngineConfig) -> bool {
    config.backend != BackendKind::DryRun
}

/// Drives the tree with the given backend and planner.
fn submit<B: ClusterBackend>(
    backend: B,
    planner: impl StepPlanner + 'static,
    composer: Composer,
    config: EngineConfig,
    cli: &Cli,
    tree: &mut WorkflowJobCollection,
) -> (Result<(), SubmissionError>, SubmissionReport) {
    let workflow_dir = composer.context().workflow_dir.clone();
    let write_descriptors = config.write_descriptors && writes_artifacts(&config);
    let slurm = config.backend == BackendKind::Slurm;
    let program = config.program.clone();

    let mut engine = SubmissionEngine::new(backend, composer, planner, config);
    if slurm {
        let adapter = match program {
            Some(program) => SlurmAdapter::new().with_program(program),
            None => SlurmAdapter::new(),
        };
        engine = engine.with_adapter(adapter);
    }
    if write_descriptors {
        engine = engine.with_descriptor_root(workflow_dir.join("descriptors"));
    }
    if let Some(path) = &cli.cancel_file {
        watch_cancel_file(path.clone(), engine.cancel_token());
    }

    let result = engine.run(tree);
    (result, engine.report().clone())
}

/// Prints the per-step summary and the final outcome.
fn print_summary(report: &SubmissionReport, result: &Result<(), SubmissionError>) {
    println!();
    println!("{}", report.summary());
    match result {
        Ok(()) => println!("{}", "Submission completed successfully".green().bold()),
        Err(SubmissionError::Failed(failures)) => {
            println!("{}", "Submission failed".red().bold());
            for failure in failures {
                println!("  {} {}", "x".red(), failure);
            }
        }
        Err(e) => println!("{}", e.to_string().yellow().bold()),
    }
}

fn save_report(report: &SubmissionReport, workflow_dir: &Path) {
    if let Err(e) = report.save(workflow_dir) {
        warn!("{}", e);
    }
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let cli = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(cli.verbose);
    print_banner();

    let description = load_description(&cli.description_path).map_err(|e| {
        error!("Failed to load workflow description: {}", e);
        e
    })?;

    if cli.validate_only {
        println!(
            "{} {} ({} stages, {} steps)",
            "Valid:".green().bold(),
            cli.description_path,
            description.stages().len(),
            description.steps().count()
        );
        return Ok(());
    }

    let config = engine_config(&cli)?;
    if config.backend == BackendKind::DryRun {
        info!("Mode: DRY RUN (jobs will not execute)");
    }

    let workflow_dir = match &cli.workflow_dir {
        Some(dir) => dir.clone(),
        None => env::current_dir()?,
    };
    let user_name = cli
        .user_name
        .clone()
        .or_else(|| env::var("USER").ok())
        .unwrap_or_else(|| "tmflow".to_string());
    let submission_id = cli
        .submission_id
        .unwrap_or_else(|| Local::now().timestamp().unsigned_abs());

    info!("Workflow directory: {}", workflow_dir.display());
    info!("Submission {} by '{}'", submission_id, user_name);

    let context = SubmissionContext::new(submission_id, user_name, workflow_dir.clone());
    let composer = Composer::new(context);
    let mut tree = composer.workflow_collection(&description)?;

    let save = writes_artifacts(&config);
    let (result, report) = match config.backend {
        BackendKind::DryRun => {
            let planner = StaticPlanner::new().with_default(RunPlan::uniform(1));
            submit(DryRunBackend::new(), planner, composer, config, &cli, &mut tree)
        }
        BackendKind::Local => {
            let backend = LocalBackend::new(config.max_running).with_working_dir(&workflow_dir);
            let planner = ManifestPlanner::new(&workflow_dir);
            submit(backend, planner, composer, config, &cli, &mut tree)
        }
        BackendKind::Slurm => {
            let planner = ManifestPlanner::new(&workflow_dir);
            submit(SlurmBackend::new(), planner, composer, config, &cli, &mut tree)
        }
    };

    if save {
        save_report(&report, &workflow_dir);
    }
    print_summary(&report, &result);
    info!("Final state of '{}': {}", tree.name(), tree.state());

    Ok(result?)
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("tmflow")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_defaults() {
        let cli = parse_arguments(&args(&[])).unwrap();
        assert_eq!(cli.description_path, DEFAULT_DESCRIPTION);
        assert!(!cli.dry_run);
        assert!(cli.submission_id.is_none());
    }

    #[test]
    fn test_parse_options() {
        let cli = parse_arguments(&args(&[
            "wf.yaml",
            "--user",
            "alice",
            "--submission-id",
            "42",
            "--max-attempts",
            "3",
            "--dry-run",
            "--workflow-dir",
            "/data/exp",
        ]))
        .unwrap();
        assert_eq!(cli.description_path, "wf.yaml");
        assert_eq!(cli.user_name.as_deref(), Some("alice"));
        assert_eq!(cli.submission_id, Some(42));
        assert_eq!(cli.max_attempts, Some(3));
        assert!(cli.dry_run);
        assert_eq!(cli.workflow_dir, Some(PathBuf::from("/data/exp")));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_arguments(&args(&["--user"])).is_err());
        assert!(parse_arguments(&args(&["--submission-id", "abc"])).is_err());
        assert!(parse_arguments(&args(&["--bogus"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "b.yaml"])).is_err());
    }

    #[test]
    fn test_engine_config_overrides() {
        let cli = parse_arguments(&args(&["--dry-run", "--max-attempts", "4"])).unwrap();
        let config = engine_config(&cli).unwrap();
        assert_eq!(config.backend, BackendKind::DryRun);
        assert_eq!(config.max_attempts, 4);

        let cli = parse_arguments(&args(&["--max-attempts", "0"])).unwrap();
        assert!(engine_config(&cli).is_err());
    }

    #[test]
    fn test_slurm_flag_selects_slurm_backend() {
        let cli = parse_arguments(&args(&["--slurm"])).unwrap();
        assert_eq!(engine_config(&cli).unwrap().backend, BackendKind::Slurm);

        // Previewing never submits
        let cli = parse_arguments(&args(&["--slurm", "--dry-run"])).unwrap();
        assert_eq!(engine_config(&cli).unwrap().backend, BackendKind::DryRun);
    }

    #[test]
    fn test_dry_run_from_config_file_writes_nothing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("tmflow.yaml");
        std::fs::write(&path, "backend: dry-run\n").unwrap();

        let config_arg = path.display().to_string();
        let cli = parse_arguments(&args(&["--config", config_arg.as_str()])).unwrap();
        assert!(!cli.dry_run);
        let config = engine_config(&cli).unwrap();
        assert!(!writes_artifacts(&config));

        assert!(writes_artifacts(&EngineConfig::default()));
    }
}
