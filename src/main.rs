// src/main.rs

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

mod config;
mod error;
mod orchestrator;
mod sys;

use crate::config::{DriverConfig, JobContext, ProfileTable};
use crate::error::{DriverError, Result};
use crate::orchestrator::{Orchestrator, RunRequest, BARE_HOST, STATIC_ANALYSIS};

/// Runs one step of a CI job, either on the host, inside a platform
/// container, or as a static-analysis scan.
#[derive(Parser, Debug)]
#[command(name = "ci-driver", version, disable_help_subcommand = true)]
struct Cli {
    /// install, build, run or all
    step: String,

    /// bare-host, static-analysis or a platform profile name
    environment: String,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,

    /// Newline-delimited JSON logs
    #[arg(long)]
    json: bool,
}

fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    // stdout carries the test banners and diagnostic reports; logs go to stderr.
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

fn usage() -> String {
    let profiles = ProfileTable::builtin()
        .map(|table| table.names().map(str::to_string).collect::<Vec<_>>().join(", "))
        .unwrap_or_default();
    format!(
        "usage: ci-driver <step> <environment>\n  \
         step: install | build | run | all\n  \
         environment: {BARE_HOST} | {STATIC_ANALYSIS} | <profile>\n  \
         profiles: {profiles}"
    )
}

async fn drive(cli: &Cli) -> Result<()> {
    // Arguments are checked before any environment state is read.
    let request = RunRequest::parse(&cli.step, &cli.environment)?;

    let lookup = |name: &str| std::env::var(name).ok();
    let ctx = JobContext::capture(&lookup)?;
    let workspace = std::env::current_dir()?;
    let profiles = ProfileTable::load(&lookup).await?;
    let config = DriverConfig::load(&lookup, &workspace, profiles)?;

    info!(
        step = %request.step,
        environment = %request.environment,
        ci = ctx.is_ci,
        cron = ctx.is_cron,
        workspace = %workspace.display(),
        "ci-driver starting"
    );

    Orchestrator::system(&config, ctx)?.run(&request).await
}

fn exit_code(err: &DriverError) -> ExitCode {
    ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let _ = e.print();
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                return ExitCode::SUCCESS;
            }
            // Any malformed invocation is a plain failure, not clap's usage status.
            eprintln!("{}", usage());
            return ExitCode::FAILURE;
        }
    };

    init_tracing(cli.json, if cli.verbose { Level::DEBUG } else { Level::INFO });

    match drive(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.is_configuration() {
                error!(error = %e, "invalid invocation or job configuration");
            } else {
                error!(error = %e, exit_code = e.exit_code(), "step failed");
            }
            if e.wants_usage() {
                eprintln!("{}", usage());
            }
            exit_code(&e)
        }
    }
}
