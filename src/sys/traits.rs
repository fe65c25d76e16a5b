// src/sys/traits.rs

use async_trait::async_trait;
use secrecy::SecretString;
use std::path::{Path, PathBuf};

use crate::config::PlatformProfile;
use crate::error::Result;
use crate::sys::exec::{CommandOutput, CommandSpec};

// ==============================================================================
// 1. Process Execution
// ==============================================================================

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the command to completion with inherited stdio and returns its
    /// exit status. Only a failure to spawn is an `Err`.
    async fn status(&self, cmd: &CommandSpec) -> Result<i32>;

    /// Runs the command to completion and captures stdout/stderr.
    async fn output(&self, cmd: &CommandSpec) -> Result<CommandOutput>;
}

// ==============================================================================
// 2. Network Transfer (Zero-Leak Tokens)
// ==============================================================================

/// A download. With form fields present the request is a form POST.
pub struct FetchRequest {
    pub url: String,
    pub form: Vec<(String, SecretString)>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            form: Vec::new(),
        }
    }
}

/// One upload of instrumented build output to the scanning service.
pub struct ScanSubmission {
    pub url: String,
    pub token: SecretString,
    pub email: String,
    pub version: String,
    pub description: String,
    pub archive: PathBuf,
}

#[async_trait]
pub trait Transfer: Send + Sync {
    /// Downloads the response body of `request` into `dest`.
    async fn fetch(&self, request: &FetchRequest, dest: &Path) -> Result<()>;

    /// Submits a multipart upload and returns the service's response text.
    async fn submit(&self, submission: &ScanSubmission) -> Result<String>;
}

// ==============================================================================
// 3. GitOps & Source Control (Transient Identity)
// ==============================================================================

#[async_trait]
pub trait GitManager: Send + Sync {
    /// Clones `repo_url` into `target_dir`, authenticating with the identity
    /// file at `identity`. The caller owns the identity file's lifetime.
    async fn clone_repo(&self, repo_url: &str, target_dir: &Path, identity: &Path) -> Result<()>;

    /// Revision identifier of the checkout at `repo_dir`.
    async fn head_revision(&self, repo_dir: &Path) -> Result<String>;
}

// ==============================================================================
// 4. Isolated Environments
// ==============================================================================

/// Names one running container bound to the working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentHandle {
    pub name: String,
}

#[async_trait]
pub trait EnvironmentManager: Send + Sync {
    /// Starts a detached container for `profile` and installs its prerequisites.
    async fn create(&self, profile: &PlatformProfile) -> Result<EnvironmentHandle>;

    /// Addresses a container created by an earlier invocation.
    fn attach(&self) -> EnvironmentHandle;

    /// Runs `argv` inside the container. Only the variables in `forward`
    /// reach the nested process. Returns the nested exit status.
    async fn exec(
        &self,
        handle: &EnvironmentHandle,
        argv: &[String],
        forward: Vec<(String, SecretString)>,
    ) -> Result<i32>;

    /// Stops and removes the container. Never fails: problems are logged.
    async fn destroy(&self, handle: &EnvironmentHandle);
}

// ==============================================================================
// 5. Build, Scan & Test
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildProfile {
    /// Release build for the test suites.
    Standard,
    /// Debug build wrapped by the static-analysis capture tool.
    Instrumented,
}

#[async_trait]
pub trait BuildManager: Send + Sync {
    async fn build(&self, profile: BuildProfile) -> Result<()>;
}

#[async_trait]
pub trait ScanManager: Send + Sync {
    /// Downloads and unpacks the static-analysis tools.
    async fn provision_tools(&self, token: &SecretString) -> Result<()>;

    /// Packages the instrumented build output and submits it.
    async fn submit(&self, token: &SecretString) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalOutcome {
    Pass,
    Fail,
}

/// Unit-suite status plus external-suite outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateTestResult {
    pub unit_status: i32,
    pub external: ExternalOutcome,
}

impl AggregateTestResult {
    /// The unit suite's status is reported verbatim. An external failure is
    /// never masked: with a passing unit suite it still yields 1.
    pub fn exit_code(&self) -> i32 {
        match (self.unit_status, self.external) {
            (0, ExternalOutcome::Fail) => 1,
            (status, _) => status,
        }
    }
}

#[async_trait]
pub trait SuiteRunner: Send + Sync {
    async fn run(&self) -> Result<AggregateTestResult>;
}
