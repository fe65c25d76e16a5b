// src/sys/credentials.rs

use secrecy::{Secret, SecretString};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::{CorpusSettings, DriverConfig, KNOWN_HOST_VAR};
use crate::error::{DriverError, Result};
use crate::sys::exec::{run_checked, CommandSpec};
use crate::sys::git::SystemGitManager;
use crate::sys::secrets::{CredentialMaterial, CredentialVars, EXPORTED_IV_VAR, EXPORTED_KEY_VAR};
use crate::sys::traits::{CommandRunner, FetchRequest, GitManager, Transfer};

/// How a private corpus request ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorpusFetch {
    Cloned,
    /// Not running under CI: the corpus has to be cloned by hand.
    SkippedLocalRun,
    /// Pull requests never receive decryption secrets.
    SkippedPullRequest,
}

/// Resolves decryption material once per process and uses it to clone the
/// private acceptance corpus over SSH.
pub struct CredentialProvisioner {
    vars: CredentialVars,
    material: OnceLock<Option<CredentialMaterial>>,
    is_ci: bool,
    is_pull_request: bool,
    corpus: CorpusSettings,
    ssh_dir: Option<PathBuf>,
    runner: Arc<dyn CommandRunner>,
    transfer: Arc<dyn Transfer>,
    git: Box<dyn GitManager>,
}

impl CredentialProvisioner {
    pub fn new(
        config: &DriverConfig,
        vars: CredentialVars,
        is_ci: bool,
        is_pull_request: bool,
        runner: Arc<dyn CommandRunner>,
        transfer: Arc<dyn Transfer>,
    ) -> Self {
        Self {
            vars,
            material: OnceLock::new(),
            is_ci,
            is_pull_request,
            corpus: config.corpus.clone(),
            ssh_dir: config.ssh_dir.clone(),
            git: Box::new(SystemGitManager::new(runner.clone())),
            runner,
            transfer,
        }
    }

    /// Memoized: the variables are only interpreted on the first call.
    pub fn resolve(&self) -> Option<&CredentialMaterial> {
        self.material.get_or_init(|| self.vars.resolve()).as_ref()
    }

    /// The resolved pair under its exported names, for nested executions.
    pub fn exported(&self) -> Vec<(String, SecretString)> {
        match self.resolve() {
            Some(material) => material.use_secret(|key, iv| {
                vec![
                    (EXPORTED_KEY_VAR.to_string(), Secret::new(key.to_string())),
                    (EXPORTED_IV_VAR.to_string(), Secret::new(iv.to_string())),
                ]
            }),
            None => Vec::new(),
        }
    }

    /// Clones the private corpus into `dest`. Callers only invoke this when
    /// `dest` does not exist yet.
    pub async fn fetch_private_corpus(&self, dest: &Path) -> Result<CorpusFetch> {
        if !self.is_ci {
            info!(
                "Note: skipping private tests (to run them, clone the private testing repo into '{}' before running this driver)",
                dest.display()
            );
            return Ok(CorpusFetch::SkippedLocalRun);
        }

        if let Some(material) = self.resolve() {
            self.clone_with(material, dest).await?;
            return Ok(CorpusFetch::Cloned);
        }

        if self.is_pull_request {
            info!("Note: skipping private tests because encrypted variables are not available in pull request builds");
            return Ok(CorpusFetch::SkippedPullRequest);
        }

        Err(DriverError::MissingCredentials)
    }

    async fn clone_with(&self, material: &CredentialMaterial, dest: &Path) -> Result<()> {
        // Checked before anything is downloaded or decrypted.
        let known_host = self.corpus.known_host.as_deref().ok_or(DriverError::MissingVariable {
            name: KNOWN_HOST_VAR,
            hint: "the known_hosts entry of the private corpus server is needed to clone it",
        })?;
        let ssh_dir = self.ssh_dir.as_deref().ok_or(DriverError::MissingVariable {
            name: "HOME",
            hint: "needed to locate the SSH trust store",
        })?;
        tokio::fs::create_dir_all(ssh_dir).await?;
        tokio::fs::set_permissions(ssh_dir, std::fs::Permissions::from_mode(0o700)).await?;

        let blob = tempfile::Builder::new()
            .prefix("ci-key-")
            .suffix(".enc")
            .tempfile_in(ssh_dir)?;
        self.transfer
            .fetch(&FetchRequest::get(&self.corpus.key_url), blob.path())
            .await?;

        // 🛡️ From here on the decrypted key exists on disk. The guard removes it
        // on every exit path, including early returns below.
        let identity = TransientIdentity::create_in(ssh_dir)?;

        let decrypt = material.use_secret(|key, iv| {
            CommandSpec::new("openssl")
                .args(["aes-256-cbc", "-d", "-in"])
                .arg(blob.path().to_string_lossy())
                .arg("-out")
                .arg(identity.path().to_string_lossy())
                .arg("-K")
                .secret_arg(Secret::new(key.to_string()))
                .arg("-iv")
                .secret_arg(Secret::new(iv.to_string()))
        });
        run_checked(self.runner.as_ref(), "openssl decrypt", &decrypt).await?;
        drop(blob);

        identity.restrict()?;
        append_known_host(&ssh_dir.join("known_hosts"), known_host).await?;

        info!(repo = %self.corpus.private_repo, "cloning private test corpus");
        let cloned = self
            .git
            .clone_repo(&self.corpus.private_repo, dest, identity.path())
            .await;

        identity.release();
        cloned
    }
}

/// Decrypted SSH identity. Deleted when released or dropped, whatever the
/// clone's outcome.
struct TransientIdentity {
    file: NamedTempFile,
}

impl TransientIdentity {
    fn create_in(dir: &Path) -> Result<Self> {
        let file = tempfile::Builder::new().prefix("id_ci_").tempfile_in(dir)?;
        let identity = Self { file };
        identity.restrict()?;
        Ok(identity)
    }

    fn path(&self) -> &Path {
        self.file.path()
    }

    /// Owner read/write only; ssh refuses keys readable by others.
    fn restrict(&self) -> Result<()> {
        std::fs::set_permissions(self.path(), std::fs::Permissions::from_mode(0o600))?;
        Ok(())
    }

    fn release(self) {
        let path = self.path().to_path_buf();
        if let Err(e) = self.file.close() {
            warn!(path = %path.display(), error = %e, "failed to remove transient identity");
        }
    }
}

async fn append_known_host(path: &Path, entry: &str) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(format!("{}\n", entry.trim_end()).as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
