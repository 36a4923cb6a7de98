//! CIFuzz - fuzz pull requests in CI
//!
//! The `cifuzz` command builds a project's fuzz targets for the change under
//! test, fuzzes them for a fixed budget and fails the job only for crashes the
//! change introduced.
//!
//! ## Commands
//!
//! - `build-fuzzers`: check out the change and compile its fuzz targets
//! - `check-build`: make sure the built targets run
//! - `run-fuzzers`: fuzz every target and classify crashes
//! - `parse-output`: turn a saved fuzzer log into `bug_summary.txt`
//! - `pipeline`: all of the above in order
//!
//! Exit codes: 0 success, 1 build failure or new bug, 2 infrastructure failure
//! or inconclusive result. `DRY_RUN=true` always exits 0.

mod github;
mod telemetry;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use cifuzz_core::config::parse_bool;
use cifuzz_core::{
    parse_crash_report, parser, CiFuzz, CifuzzError, DockerConfig, FuzzRunResult, PipelineResult,
    RunConfig, Sanitizer,
};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, Level};

const EXIT_SUCCESS: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_INFRA: u8 = 2;

#[derive(Parser)]
#[command(name = "cifuzz")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Continuous fuzzing for pull requests", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Print the step result as JSON on stdout
    #[arg(long, global = true)]
    json_result: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check out the change under test and build its fuzz targets
    BuildFuzzers(RunArgs),

    /// Validate that the built fuzz targets run
    CheckBuild(RunArgs),

    /// Fuzz every built target and classify crashes
    RunFuzzers(RunArgs),

    /// Write bug_summary.txt from a saved fuzzer log
    ParseOutput {
        /// Fuzzer log to parse ("-" for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Directory to write bug_summary.txt into
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
    },

    /// Build, check and fuzz in one go
    Pipeline(RunArgs),
}

/// Settings for one run, read from flags or the CI environment.
#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// OSS-Fuzz project name
    #[arg(long, env = "OSS_FUZZ_PROJECT_NAME")]
    project_name: String,

    /// Repository under test, as owner/repo
    #[arg(long, env = "GITHUB_REPOSITORY")]
    repository: Option<String>,

    /// Directory holding the build output and checked-out sources
    #[arg(long, env = "GITHUB_WORKSPACE")]
    workspace: PathBuf,

    #[arg(long, env = "SANITIZER", default_value = "address")]
    sanitizer: Sanitizer,

    /// Commit to build
    #[arg(long, env = "GITHUB_SHA")]
    commit_sha: Option<String>,

    /// Pull request ref to build (derived from the event payload if omitted)
    #[arg(long)]
    pr_ref: Option<String>,

    #[arg(long, env = "GITHUB_BASE_REF")]
    base_ref: Option<String>,

    #[arg(long, env = "GITHUB_EVENT_NAME", hide = true)]
    event_name: Option<String>,

    #[arg(long, env = "GITHUB_EVENT_PATH", hide = true)]
    event_path: Option<PathBuf>,

    /// Local checkout to build instead of cloning the repository
    #[arg(long, env = "PROJECT_SRC_PATH")]
    project_src_path: Option<PathBuf>,

    /// Directory in the repository holding the build Dockerfile
    #[arg(long, env = "BUILD_INTEGRATION_PATH")]
    build_integration_path: Option<PathBuf>,

    /// Total fuzzing budget in seconds
    #[arg(long, env = "FUZZ_SECONDS")]
    fuzz_seconds: Option<u64>,

    /// Percentage of targets allowed to fail the build check
    #[arg(long, env = "ALLOWED_BROKEN_TARGETS_PERCENTAGE")]
    allowed_broken_targets_percentage: Option<u8>,

    /// Report results but always exit 0
    #[arg(long, env = "DRY_RUN", default_value = "false", value_parser = parse_flag, action = clap::ArgAction::Set)]
    dry_run: bool,

    #[arg(long, env = "DOCKER_BINARY", default_value = "docker")]
    docker_binary: String,

    /// OSS-Fuzz projects/ directory (internal projects only)
    #[arg(long, env = "OSS_FUZZ_PROJECTS_DIR", default_value = "projects")]
    projects_dir: PathBuf,
}

fn parse_flag(value: &str) -> std::result::Result<bool, String> {
    parse_bool(value).ok_or_else(|| format!("invalid boolean: {value}"))
}

impl RunArgs {
    fn to_config(&self) -> Result<RunConfig> {
        let pr_ref = match &self.pr_ref {
            Some(pr_ref) => Some(pr_ref.clone()),
            None => github::pr_ref_from_event(self.event_name.as_deref(), self.event_path.as_deref())?,
        };

        let mut builder = RunConfig::builder()
            .project_name(&self.project_name)
            .workspace(&self.workspace)
            .sanitizer(self.sanitizer)
            .dry_run(self.dry_run);
        if let Some(repository) = &self.repository {
            builder = builder.project_repo_name(github::repo_name(repository));
        }
        if let Some(sha) = &self.commit_sha {
            builder = builder.commit_sha(sha);
        }
        if let Some(pr_ref) = pr_ref {
            builder = builder.pr_ref(pr_ref);
        }
        if let Some(base_ref) = &self.base_ref {
            builder = builder.base_ref(base_ref);
        }
        if let Some(path) = &self.project_src_path {
            builder = builder.project_src_path(path);
        }
        if let Some(path) = &self.build_integration_path {
            builder = builder.build_integration_path(path);
        }
        if let Some(seconds) = self.fuzz_seconds {
            builder = builder.fuzz_seconds(seconds);
        }
        if let Some(percentage) = self.allowed_broken_targets_percentage {
            builder = builder.allowed_broken_targets_percentage(percentage);
        }
        builder.build().context("Invalid run configuration")
    }

    fn cifuzz(&self) -> CiFuzz {
        let docker = DockerConfig {
            docker_binary: self.docker_binary.clone(),
            projects_dir: self.projects_dir.clone(),
            ..Default::default()
        };
        CiFuzz::docker(docker, self.repository.as_deref().map(github::repository_url))
    }
}

#[derive(Serialize)]
struct StepResult<'a, T: Serialize> {
    step: &'a str,
    exit_code: u8,
    result: T,
}

fn print_result<T: Serialize>(json: bool, step: &str, exit_code: u8, result: T) -> Result<()> {
    if json {
        let out = StepResult {
            step,
            exit_code,
            result,
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
    }
    Ok(())
}

fn fuzz_exit_code(result: &FuzzRunResult) -> u8 {
    match result.as_tuple() {
        (_, true) => EXIT_FAILURE,
        (true, false) => EXIT_SUCCESS,
        (false, false) => EXIT_INFRA,
    }
}

fn pipeline_exit_code(result: &PipelineResult) -> u8 {
    if !result.built || !result.checked {
        return EXIT_FAILURE;
    }
    result.fuzz.as_ref().map_or(EXIT_INFRA, fuzz_exit_code)
}

fn effective_exit_code(exit_code: u8, dry_run: bool) -> u8 {
    if dry_run && exit_code != EXIT_SUCCESS {
        info!(exit_code, "Dry run; exiting with success");
        return EXIT_SUCCESS;
    }
    exit_code
}

fn finish(exit_code: u8, dry_run: bool) -> ExitCode {
    ExitCode::from(effective_exit_code(exit_code, dry_run))
}

fn fatal(err: CifuzzError) -> ExitCode {
    error!(error = %err, "Fatal error");
    ExitCode::from(EXIT_INFRA)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    telemetry::init_tracing(cli.json, level);

    match &cli.command {
        Commands::BuildFuzzers(args) => cmd_build_fuzzers(args, cli.json_result).await,
        Commands::CheckBuild(args) => cmd_check_build(args, cli.json_result).await,
        Commands::RunFuzzers(args) => cmd_run_fuzzers(args, cli.json_result).await,
        Commands::ParseOutput { input, output_dir } => {
            cmd_parse_output(input, output_dir, cli.json_result)
        }
        Commands::Pipeline(args) => cmd_pipeline(args, cli.json_result).await,
    }
}

async fn cmd_build_fuzzers(args: &RunArgs, json: bool) -> Result<ExitCode> {
    let config = args.to_config()?;
    let built = match args.cifuzz().build_fuzzers(&config).await {
        Ok(built) => built,
        Err(e) => return Ok(fatal(e)),
    };
    let exit_code = if built { EXIT_SUCCESS } else { EXIT_FAILURE };
    if !built {
        error!("Error building fuzzers for {}", config.project_name());
    }
    print_result(json, "build_fuzzers", exit_code, built)?;
    Ok(finish(exit_code, config.dry_run()))
}

async fn cmd_check_build(args: &RunArgs, json: bool) -> Result<ExitCode> {
    let config = args.to_config()?;
    let passed = args.cifuzz().check_build(&config).await;
    let exit_code = if passed { EXIT_SUCCESS } else { EXIT_FAILURE };
    print_result(json, "check_build", exit_code, passed)?;
    Ok(finish(exit_code, config.dry_run()))
}

async fn cmd_run_fuzzers(args: &RunArgs, json: bool) -> Result<ExitCode> {
    let config = args.to_config()?;
    let result = args.cifuzz().run_fuzzers(&config).await;
    let exit_code = fuzz_exit_code(&result);
    report_fuzz_result(&result);
    print_result(json, "run_fuzzers", exit_code, &result)?;
    Ok(finish(exit_code, config.dry_run()))
}

async fn cmd_pipeline(args: &RunArgs, json: bool) -> Result<ExitCode> {
    let config = args.to_config()?;
    let result = match args.cifuzz().run_pipeline(&config).await {
        Ok(result) => result,
        Err(e) => return Ok(fatal(e)),
    };
    if let Some(fuzz) = &result.fuzz {
        report_fuzz_result(fuzz);
    }
    let exit_code = pipeline_exit_code(&result);
    print_result(json, "pipeline", exit_code, &result)?;
    Ok(finish(exit_code, config.dry_run()))
}

fn cmd_parse_output(input: &Path, output_dir: &Path, json: bool) -> Result<ExitCode> {
    let mut raw = Vec::new();
    if input == Path::new("-") {
        std::io::stdin()
            .read_to_end(&mut raw)
            .context("Failed to read fuzzer output from stdin")?;
    } else {
        raw = std::fs::read(input)
            .with_context(|| format!("Failed to read fuzzer output {}", input.display()))?;
    }

    let summary = parse_crash_report(&raw);
    parser::parse_fuzzer_output(&raw, output_dir);
    match &summary {
        Some(summary) => info!(crash_type = %summary.crash_type, "Wrote bug summary"),
        None => info!("No crash report found"),
    }
    print_result(json, "parse_output", EXIT_SUCCESS, &summary)?;
    Ok(ExitCode::SUCCESS)
}

fn report_fuzz_result(result: &FuzzRunResult) {
    let Some(report) = &result.bug_report else {
        return;
    };
    match report.crash_type.as_deref() {
        Some(crash_type) => error!(
            target = %report.target,
            verdict = report.verdict.as_str(),
            "Fuzzer crashed: {crash_type}"
        ),
        None => error!(
            target = %report.target,
            verdict = report.verdict.as_str(),
            "Fuzzer crashed"
        ),
    }
    for location in &report.locations {
        error!("  {location}");
    }
}
