// src/config.rs

use secrecy::{Secret, SecretString};
use serde::Deserialize;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use crate::error::{DriverError, Result};
use crate::sys::secrets::CredentialVars;

/// Lookup into the process environment (or a map, in tests).
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

// CI service variables read by `JobContext::capture`.
pub const CI_VAR: &str = "TRAVIS";
pub const EVENT_TYPE_VAR: &str = "TRAVIS_EVENT_TYPE";
pub const JOB_NUMBER_VAR: &str = "TRAVIS_JOB_NUMBER";
pub const PULL_REQUEST_VAR: &str = "TRAVIS_PULL_REQUEST";
pub const SCAN_TOKEN_VAR: &str = "COV_TOKEN";

const BUILTIN_PROFILES: &str = include_str!("profiles.json");

/// Host entry for the private corpus server, in `known_hosts` format.
pub const KNOWN_HOST_VAR: &str = "CI_DRIVER_KNOWN_HOST";

// ==============================================================================
// 1. Platform Profiles
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlatformProfile {
    pub name: String,
    pub install_commands: Vec<String>,
}

impl PlatformProfile {
    /// Container image for this profile: `ubuntu_18.04` runs as `ubuntu:18.04`.
    pub fn image(&self) -> String {
        self.name.replace('_', ":")
    }

    /// The install commands as one statement list. A failing command does not
    /// stop the ones after it; only the last status is reported.
    pub fn install_script(&self) -> String {
        self.install_commands.join("; ")
    }
}

#[derive(Debug, Clone)]
pub struct ProfileTable {
    profiles: Vec<PlatformProfile>,
}

impl ProfileTable {
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_PROFILES)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let profiles: Vec<PlatformProfile> = serde_json::from_str(raw)?;

        let mut seen = HashSet::new();
        for profile in &profiles {
            if profile.name.is_empty() {
                return Err(DriverError::InvalidProfiles("profile with empty name".into()));
            }
            if !seen.insert(profile.name.as_str()) {
                return Err(DriverError::InvalidProfiles(format!(
                    "duplicate profile '{}'",
                    profile.name
                )));
            }
        }

        Ok(Self { profiles })
    }

    /// The table named by `CI_DRIVER_PROFILES`, or the built-in one.
    pub async fn load(lookup: Lookup<'_>) -> Result<Self> {
        let Some(path) = lookup("CI_DRIVER_PROFILES") else {
            return Self::builtin();
        };
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| DriverError::InvalidSetting {
                name: "CI_DRIVER_PROFILES".into(),
                value: path.clone(),
                reason: e.to_string(),
            })?;
        Self::from_json(&raw)
    }

    pub fn get(&self, name: &str) -> Option<&PlatformProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.iter().map(|p| p.name.as_str())
    }
}

// ==============================================================================
// 2. Driver Settings
// ==============================================================================

/// Layout of the unit suite and the external acceptance suite.
#[derive(Clone, Debug)]
pub struct CorpusSettings {
    pub unit_dir: PathBuf,
    pub btest: String,
    pub external_dir: PathBuf,
    pub public_name: String,
    pub private_name: String,
    pub key_url: String,
    pub private_repo: String,
    /// No default: a wrong entry would either break or weaken host verification.
    pub known_host: Option<String>,
}

impl CorpusSettings {
    pub fn public_dir(&self) -> PathBuf {
        self.external_dir.join(&self.public_name)
    }

    pub fn private_dir(&self) -> PathBuf {
        self.external_dir.join(&self.private_name)
    }

    pub fn diag_log(&self) -> PathBuf {
        self.public_dir().join("diag.log")
    }
}

#[derive(Clone, Debug)]
pub struct ScanSettings {
    pub project: String,
    pub email: String,
    pub download_url: String,
    pub submit_url: String,
    pub tools_dir: PathBuf,
    pub intermediate_dir: String,
    pub archive_name: String,
}

#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub workspace: PathBuf,
    pub container_name: String,
    pub mount_path: String,
    pub nested_command: String,
    pub build_jobs: NonZeroUsize,
    pub test_jobs: NonZeroUsize,
    pub scan_jobs: NonZeroUsize,
    pub ssh_dir: Option<PathBuf>,
    pub search_path: String,
    pub profiles: ProfileTable,
    pub corpus: CorpusSettings,
    pub scan: ScanSettings,
}

impl DriverConfig {
    pub fn load(lookup: Lookup<'_>, workspace: &Path, profiles: ProfileTable) -> Result<Self> {
        let setting = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        // 🛡️ Parallelism is always explicit. An unset or zero job count would let
        // the delegated tool pick an unbounded value on a shared CI worker.
        let build_jobs = parse_jobs(lookup, "CI_DRIVER_BUILD_JOBS", 2)?;
        let test_jobs = parse_jobs(lookup, "CI_DRIVER_TEST_JOBS", 4)?;
        let scan_jobs = parse_jobs(lookup, "CI_DRIVER_SCAN_JOBS", 4)?;

        let ssh_dir = lookup("CI_DRIVER_SSH_DIR")
            .map(PathBuf::from)
            .or_else(|| lookup("HOME").map(|home| Path::new(&home).join(".ssh")));

        let external_dir = workspace.join("testing/external");

        Ok(Self {
            workspace: workspace.to_path_buf(),
            container_name: setting("CI_DRIVER_CONTAINER_NAME", "brotest"),
            mount_path: setting("CI_DRIVER_MOUNT_PATH", "/bro"),
            nested_command: setting("CI_DRIVER_NESTED_COMMAND", "testing/scripts/ci-driver"),
            build_jobs,
            test_jobs,
            scan_jobs,
            ssh_dir,
            search_path: setting("PATH", "/usr/local/bin:/usr/bin:/bin"),
            profiles,
            corpus: CorpusSettings {
                unit_dir: workspace.join("testing/btest"),
                btest: "../../aux/btest/btest".into(),
                external_dir,
                public_name: "bro-testing".into(),
                private_name: "bro-testing-private".into(),
                key_url: setting(
                    "CI_DRIVER_KEY_URL",
                    "https://www.bro.org/static/travis-ci/travis_key.enc",
                ),
                private_repo: setting(
                    "CI_DRIVER_PRIVATE_REPO",
                    "ssh://git@git.bro.org/bro-testing-private",
                ),
                known_host: lookup(KNOWN_HOST_VAR).filter(|entry| !entry.trim().is_empty()),
            },
            scan: ScanSettings {
                project: "Bro".into(),
                email: setting("CI_DRIVER_SCAN_EMAIL", "bro-commits-internal@bro.org"),
                download_url: "https://scan.coverity.com/download/cxx/linux64".into(),
                submit_url: "https://scan.coverity.com/builds?project=Bro".into(),
                tools_dir: workspace.join("coverity-tools"),
                intermediate_dir: "cov-int".into(),
                archive_name: "myproject.bz2".into(),
            },
        })
    }

    pub fn build_dir(&self) -> PathBuf {
        self.workspace.join("build")
    }

    pub fn version_file(&self) -> PathBuf {
        self.workspace.join("VERSION")
    }
}

fn parse_jobs(lookup: Lookup<'_>, name: &str, default: usize) -> Result<NonZeroUsize> {
    let Some(raw) = lookup(name) else {
        return NonZeroUsize::new(default).ok_or_else(|| DriverError::InvalidSetting {
            name: name.into(),
            value: default.to_string(),
            reason: "job count must be positive".into(),
        });
    };

    raw.trim()
        .parse::<usize>()
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| DriverError::InvalidSetting {
            name: name.into(),
            value: raw.clone(),
            reason: "job count must be a positive integer".into(),
        })
}

// ==============================================================================
// 3. Job Context (the only reader of CI state)
// ==============================================================================

#[derive(Debug)]
pub struct JobContext {
    pub is_ci: bool,
    pub is_cron: bool,
    pub job_ordinal: Option<u32>,
    pub is_pull_request: bool,
    pub scan_token: Option<SecretString>,
    pub credentials: CredentialVars,
}

impl JobContext {
    pub fn capture(lookup: Lookup<'_>) -> Result<Self> {
        let is_cron = lookup(EVENT_TYPE_VAR).as_deref() == Some("cron");

        let job_ordinal = if is_cron {
            Some(parse_job_ordinal(lookup(JOB_NUMBER_VAR))?)
        } else {
            None
        };

        let is_pull_request = matches!(
            lookup(PULL_REQUEST_VAR).as_deref(),
            Some(v) if !v.is_empty() && v != "false"
        );

        Ok(Self {
            is_ci: lookup(CI_VAR).as_deref() == Some("true"),
            is_cron,
            job_ordinal,
            is_pull_request,
            scan_token: lookup(SCAN_TOKEN_VAR)
                .filter(|t| !t.is_empty())
                .map(Secret::new),
            credentials: CredentialVars::capture(lookup),
        })
    }

    /// Moves the credential variables out; they are owned by the provisioner.
    pub fn take_credentials(&mut self) -> CredentialVars {
        std::mem::take(&mut self.credentials)
    }
}

/// Parses the ordinal out of a `group.ordinal` job identifier.
pub fn parse_job_ordinal(job_id: Option<String>) -> Result<u32> {
    let job_id = job_id
        .filter(|id| !id.trim().is_empty())
        .ok_or(DriverError::MissingVariable {
            name: JOB_NUMBER_VAR,
            hint: "required to pick the scan job of a cron build",
        })?;

    let ordinal = job_id
        .trim()
        .split_once('.')
        .and_then(|(_, ordinal)| ordinal.parse::<u32>().ok());
    ordinal.ok_or(DriverError::MalformedJobId(job_id))
}
