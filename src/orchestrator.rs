// src/orchestrator.rs

use secrecy::{Secret, SecretString};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::config::{DriverConfig, JobContext, PlatformProfile, ProfileTable, CI_VAR, PULL_REQUEST_VAR};
use crate::error::{DriverError, Result};
use crate::sys::build::SystemBuildManager;
use crate::sys::container::{ContainerLease, DockerEnvironmentManager};
use crate::sys::credentials::CredentialProvisioner;
use crate::sys::exec::SystemCommandRunner;
use crate::sys::scan::CoverityScanManager;
use crate::sys::suite::{into_step_result, SystemSuiteRunner};
use crate::sys::traits::{
    BuildManager, BuildProfile, CommandRunner, EnvironmentHandle, EnvironmentManager, ScanManager,
    SuiteRunner, Transfer,
};
use crate::sys::transfer::HttpTransfer;

/// Environment marker for running directly on the CI host.
pub const BARE_HOST: &str = "bare-host";
/// Environment marker for a static-analysis scan build.
pub const STATIC_ANALYSIS: &str = "static-analysis";

// ==============================================================================
// 1. Requests & Modes
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Install,
    Build,
    Run,
    All,
}

impl FromStr for Step {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "install" => Ok(Step::Install),
            "build" => Ok(Step::Build),
            "run" => Ok(Step::Run),
            "all" => Ok(Step::All),
            other => Err(DriverError::UnknownStep(other.to_string())),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::Install => "install",
            Step::Build => "build",
            Step::Run => "run",
            Step::All => "all",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub step: Step,
    pub environment: String,
}

impl RunRequest {
    pub fn parse(step: &str, environment: &str) -> Result<Self> {
        Ok(Self {
            step: step.parse()?,
            environment: environment.to_string(),
        })
    }
}

#[derive(Debug)]
pub enum ExecutionMode {
    Bare,
    Container(PlatformProfile),
    StaticAnalysis(SecretString),
}

/// What a run amounts to once the job context is taken into account.
#[derive(Debug)]
pub enum Dispatch {
    /// Scheduled builds scan only from their first job; the rest succeed silently.
    Skip { ordinal: u32 },
    Execute(ExecutionMode),
}

impl ExecutionMode {
    pub fn select(environment: &str, ctx: &JobContext, profiles: &ProfileTable) -> Result<Dispatch> {
        if ctx.is_cron {
            let ordinal = ctx.job_ordinal.ok_or(DriverError::MissingVariable {
                name: crate::config::JOB_NUMBER_VAR,
                hint: "required to pick the scan job of a cron build",
            })?;
            if ordinal != 1 {
                return Ok(Dispatch::Skip { ordinal });
            }
        }

        if ctx.is_cron || environment == STATIC_ANALYSIS {
            let token = ctx.scan_token.as_ref().ok_or(DriverError::MissingVariable {
                name: crate::config::SCAN_TOKEN_VAR,
                hint: "should be defined in the environment variables section of the CI settings",
            })?;
            return Ok(Dispatch::Execute(ExecutionMode::StaticAnalysis(reseal(token))));
        }

        if environment == BARE_HOST {
            return Ok(Dispatch::Execute(ExecutionMode::Bare));
        }

        profiles
            .get(environment)
            .map(|profile| Dispatch::Execute(ExecutionMode::Container(profile.clone())))
            .ok_or_else(|| DriverError::UnknownProfile(environment.to_string()))
    }
}

fn reseal(secret: &SecretString) -> SecretString {
    use secrecy::ExposeSecret;
    Secret::new(secret.expose_secret().clone())
}

// ==============================================================================
// 2. Orchestrator
// ==============================================================================

pub struct Orchestrator {
    ctx: JobContext,
    profiles: ProfileTable,
    nested_command: String,
    env_mgr: Box<dyn EnvironmentManager>,
    build_mgr: Box<dyn BuildManager>,
    scan_mgr: Box<dyn ScanManager>,
    suite: Box<dyn SuiteRunner>,
    credentials: Arc<CredentialProvisioner>,
}

impl Orchestrator {
    /// Wires the host implementations of every collaborator.
    pub fn system(config: &DriverConfig, mut ctx: JobContext) -> Result<Self> {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
        let transfer: Arc<dyn Transfer> = Arc::new(HttpTransfer::new()?);

        let credentials = Arc::new(CredentialProvisioner::new(
            config,
            ctx.take_credentials(),
            ctx.is_ci,
            ctx.is_pull_request,
            runner.clone(),
            transfer.clone(),
        ));

        Ok(Self::new(
            ctx,
            config.profiles.clone(),
            config.nested_command.clone(),
            Box::new(DockerEnvironmentManager::new(config, runner.clone())),
            Box::new(SystemBuildManager::new(config, runner.clone())),
            Box::new(CoverityScanManager::new(config, runner.clone(), transfer)),
            Box::new(SystemSuiteRunner::new(config, runner, credentials.clone())),
            credentials,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: JobContext,
        profiles: ProfileTable,
        nested_command: String,
        env_mgr: Box<dyn EnvironmentManager>,
        build_mgr: Box<dyn BuildManager>,
        scan_mgr: Box<dyn ScanManager>,
        suite: Box<dyn SuiteRunner>,
        credentials: Arc<CredentialProvisioner>,
    ) -> Self {
        Self {
            ctx,
            profiles,
            nested_command,
            env_mgr,
            build_mgr,
            scan_mgr,
            suite,
            credentials,
        }
    }

    pub async fn run(&self, request: &RunRequest) -> Result<()> {
        let mode = match ExecutionMode::select(&request.environment, &self.ctx, &self.profiles)? {
            Dispatch::Skip { ordinal } => {
                info!(ordinal, "scheduled build: only the first job scans; nothing to do");
                return Ok(());
            }
            Dispatch::Execute(mode) => mode,
        };

        info!(step = %request.step, ?mode, "dispatching");
        match mode {
            ExecutionMode::StaticAnalysis(token) => self.run_static_analysis(request.step, &token).await,
            ExecutionMode::Bare => self.run_bare(request.step).await,
            ExecutionMode::Container(profile) => self.run_container(request.step, &profile).await,
        }
    }

    async fn run_static_analysis(&self, step: Step, token: &SecretString) -> Result<()> {
        if matches!(step, Step::Install | Step::All) {
            self.scan_mgr.provision_tools(token).await?;
        }
        if matches!(step, Step::Build | Step::All) {
            self.build_mgr.build(BuildProfile::Instrumented).await?;
        }
        if matches!(step, Step::Run | Step::All) {
            self.scan_mgr.submit(token).await?;
        }
        Ok(())
    }

    async fn run_bare(&self, step: Step) -> Result<()> {
        match step {
            Step::Install => {
                info!("bare host: prerequisites are assumed to be installed");
                Ok(())
            }
            Step::Build => self.build_mgr.build(BuildProfile::Standard).await,
            Step::Run => into_step_result(self.suite.run().await?),
            Step::All => {
                self.build_mgr.build(BuildProfile::Standard).await?;
                into_step_result(self.suite.run().await?)
            }
        }
    }

    async fn run_container(&self, step: Step, profile: &PlatformProfile) -> Result<()> {
        match step {
            Step::Install => self.env_mgr.create(profile).await.map(|_| ()),
            Step::Build => self.build_in(&self.env_mgr.attach()).await,
            Step::Run => self.test_in(&self.env_mgr.attach()).await,
            Step::All => {
                let handle = self.env_mgr.create(profile).await?;
                let lease = ContainerLease::new(self.env_mgr.as_ref(), handle);

                self.build_in(lease.handle()).await?;
                self.test_in(lease.handle()).await?;

                lease.release().await;
                Ok(())
            }
        }
    }

    async fn build_in(&self, handle: &EnvironmentHandle) -> Result<()> {
        let status = self
            .env_mgr
            .exec(handle, &self.nested_argv(Step::Build), Vec::new())
            .await?;
        match status {
            0 => Ok(()),
            code => Err(DriverError::command_failed(format!("build in container {}", handle.name), code)),
        }
    }

    async fn test_in(&self, handle: &EnvironmentHandle) -> Result<()> {
        let status = self
            .env_mgr
            .exec(handle, &self.nested_argv(Step::Run), self.forwarded_env())
            .await?;
        match status {
            0 => Ok(()),
            code => Err(DriverError::command_failed(format!("tests in container {}", handle.name), code)),
        }
    }

    /// The nested driver runs the same step directly on the container host.
    fn nested_argv(&self, step: Step) -> Vec<String> {
        vec![self.nested_command.clone(), step.to_string(), BARE_HOST.to_string()]
    }

    /// CI flags and decryption material the nested test run needs.
    fn forwarded_env(&self) -> Vec<(String, SecretString)> {
        let mut vars = Vec::new();
        if self.ctx.is_ci {
            vars.push((CI_VAR.to_string(), Secret::new("true".to_string())));
            let pr = if self.ctx.is_pull_request { "true" } else { "false" };
            vars.push((PULL_REQUEST_VAR.to_string(), Secret::new(pr.to_string())));
        }
        vars.extend(self.credentials.exported());
        vars
    }
}
