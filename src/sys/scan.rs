// src/sys/scan.rs

use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret, SecretString};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::{DriverConfig, ScanSettings};
use crate::error::{DriverError, Result};
use crate::sys::exec::{run_checked, CommandSpec};
use crate::sys::git::SystemGitManager;
use crate::sys::traits::{CommandRunner, FetchRequest, GitManager, ScanManager, ScanSubmission, Transfer};

const TOOL_ARCHIVE: &str = "coverity_tool.tgz";
const UNPACKED_PREFIX: &str = "cov-analysis";

/// Static-analysis tool provisioning and result submission.
pub struct CoverityScanManager {
    runner: Arc<dyn CommandRunner>,
    transfer: Arc<dyn Transfer>,
    git: Box<dyn GitManager>,
    workspace: PathBuf,
    build_dir: PathBuf,
    version_file: PathBuf,
    settings: ScanSettings,
}

impl CoverityScanManager {
    pub fn new(config: &DriverConfig, runner: Arc<dyn CommandRunner>, transfer: Arc<dyn Transfer>) -> Self {
        Self {
            git: Box::new(SystemGitManager::new(runner.clone())),
            runner,
            transfer,
            workspace: config.workspace.clone(),
            build_dir: config.build_dir(),
            version_file: config.version_file(),
            settings: config.scan.clone(),
        }
    }

    /// Removes leftovers of an earlier provisioning run.
    async fn remove_previous_tools(&self) -> Result<()> {
        let mut stale = vec![self.workspace.join(TOOL_ARCHIVE), self.settings.tools_dir.clone()];
        stale.extend(self.unpacked_dirs().await?);

        for path in stale {
            let removed = if path.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match removed {
                Ok(()) => info!(path = %path.display(), "removed previous scan tools"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn unpacked_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.workspace).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(UNPACKED_PREFIX) {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }
}

#[async_trait]
impl ScanManager for CoverityScanManager {
    async fn provision_tools(&self, token: &SecretString) -> Result<()> {
        self.remove_previous_tools().await?;

        info!(url = %self.settings.download_url, "downloading scan tools");
        let archive = self.workspace.join(TOOL_ARCHIVE);
        let request = FetchRequest {
            url: self.settings.download_url.clone(),
            form: vec![
                ("token".into(), Secret::new(token.expose_secret().clone())),
                ("project".into(), Secret::new(self.settings.project.clone())),
            ],
        };
        self.transfer.fetch(&request, &archive).await?;

        let unpack = CommandSpec::new("tar")
            .arg("xzf")
            .arg(TOOL_ARCHIVE)
            .current_dir(&self.workspace);
        run_checked(self.runner.as_ref(), "tar xzf", &unpack).await?;
        tokio::fs::remove_file(&archive).await?;

        let unpacked = self
            .unpacked_dirs()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::MissingArtifact(format!("{}* directory in {}", UNPACKED_PREFIX, TOOL_ARCHIVE)))?;
        tokio::fs::rename(&unpacked, &self.settings.tools_dir).await?;

        info!(dir = %self.settings.tools_dir.display(), "scan tools ready");
        Ok(())
    }

    async fn submit(&self, token: &SecretString) -> Result<()> {
        let version = tokio::fs::read_to_string(&self.version_file)
            .await
            .map_err(|e| DriverError::MissingArtifact(format!("{}: {}", self.version_file.display(), e)))?
            .trim()
            .to_string();
        let description = self.git.head_revision(&self.workspace).await?;

        info!("creating tar file and sending to scan service");
        let package = CommandSpec::new("tar")
            .args(["cjf", self.settings.archive_name.as_str(), self.settings.intermediate_dir.as_str()])
            .current_dir(&self.build_dir);
        run_checked(self.runner.as_ref(), "tar cjf", &package).await?;

        let submission = ScanSubmission {
            url: self.settings.submit_url.clone(),
            token: Secret::new(token.expose_secret().clone()),
            email: self.settings.email.clone(),
            version,
            description,
            archive: self.build_dir.join(&self.settings.archive_name),
        };
        let response = self.transfer.submit(&submission).await?;
        info!(response = %response.trim(), "scan submitted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::testing::{test_config, FakeTransfer, ScriptedRunner};

    fn token() -> SecretString {
        Secret::new("scan-token".to_string())
    }

    #[tokio::test]
    async fn provisions_tools_from_archive() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path();
        std::fs::create_dir_all(ws.join("cov-analysis-old")).unwrap();

        let runner = Arc::new(
            ScriptedRunner::new().creates("tar xzf", ws.join("cov-analysis-linux64-2017.07")),
        );
        let transfer = Arc::new(FakeTransfer::with_body(b"tgz"));
        let config = test_config(ws, &[]);
        let scanner = CoverityScanManager::new(&config, runner.clone(), transfer.clone());

        scanner.provision_tools(&token()).await.unwrap();

        let fetched = transfer.fetched();
        assert_eq!(fetched[0].0, "https://scan.coverity.com/download/cxx/linux64");
        assert_eq!(fetched[0].1, vec!["token", "project"]);
        assert!(ws.join("coverity-tools").is_dir());
        assert!(!ws.join("coverity_tool.tgz").exists());
        assert!(!ws.join("cov-analysis-old").exists());
        assert!(!ws.join("cov-analysis-linux64-2017.07").exists());
    }

    #[tokio::test]
    async fn empty_archive_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let transfer = Arc::new(FakeTransfer::with_body(b"tgz"));
        let config = test_config(root.path(), &[]);
        let scanner = CoverityScanManager::new(&config, runner, transfer);

        let err = scanner.provision_tools(&token()).await.unwrap_err();
        assert!(matches!(err, DriverError::MissingArtifact(_)));
    }

    #[tokio::test]
    async fn submits_packaged_build() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path();
        std::fs::write(ws.join("VERSION"), "2.6-beta\n").unwrap();

        let runner = Arc::new(ScriptedRunner::new().stdout("git rev-parse HEAD", "abc123\n"));
        let transfer = Arc::new(FakeTransfer::default());
        let config = test_config(ws, &[]);
        let scanner = CoverityScanManager::new(&config, runner.clone(), transfer.clone());

        scanner.submit(&token()).await.unwrap();

        let package = runner.find("tar cjf").unwrap();
        assert_eq!(package.line, "tar cjf myproject.bz2 cov-int");
        assert_eq!(package.cwd, Some(ws.join("build")));

        let sent = &transfer.submitted()[0];
        assert_eq!(sent.url, "https://scan.coverity.com/builds?project=Bro");
        assert_eq!(sent.token, "scan-token");
        assert_eq!(sent.email, "bro-commits-internal@bro.org");
        assert_eq!(sent.version, "2.6-beta");
        assert_eq!(sent.description, "abc123");
        assert_eq!(sent.archive, ws.join("build/myproject.bz2"));
    }

    #[tokio::test]
    async fn rejected_upload_fails() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("VERSION"), "2.6\n").unwrap();
        let config = test_config(root.path(), &[]);
        let scanner = CoverityScanManager::new(
            &config,
            Arc::new(ScriptedRunner::new()),
            Arc::new(FakeTransfer::failing()),
        );
        assert!(matches!(
            scanner.submit(&token()).await.unwrap_err(),
            DriverError::Transfer(_)
        ));
    }
}
