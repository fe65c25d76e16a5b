// src/sys/git.rs

use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use crate::error::{DriverError, Result};
use crate::sys::exec::CommandSpec;
use crate::sys::traits::{CommandRunner, GitManager};

pub struct SystemGitManager {
    runner: Arc<dyn CommandRunner>,
}

impl SystemGitManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// 🛡️ Redacts credentials in `https://[TOKEN]@host` or `git@[TOKEN]:repo` forms.
    fn scrub_credentials(input: &str) -> String {
        static RE: OnceLock<regex::Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            regex::Regex::new(r"(://|git@)([^@\s]+)@").expect("scrub pattern is valid")
        });
        re.replace_all(input, "$1[REDACTED]@").to_string()
    }
}

#[async_trait]
impl GitManager for SystemGitManager {
    async fn clone_repo(&self, repo_url: &str, target_dir: &Path, identity: &Path) -> Result<()> {
        // 🛡️ Argument injection guard
        if repo_url.starts_with('-') {
            return Err(DriverError::InvalidSetting {
                name: "repository url".into(),
                value: repo_url.into(),
                reason: "suspicious git argument".into(),
            });
        }

        let ssh_cmd = format!(
            "ssh -i {} -o IdentitiesOnly=yes -o BatchMode=yes",
            identity.display()
        );

        let cmd = CommandSpec::new("git")
            .args(["-c", "core.hooksPath=/dev/null", "clone", "--"])
            .arg(repo_url)
            .arg(target_dir.to_string_lossy())
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_SSH_COMMAND", ssh_cmd);

        let output = self.runner.output(&cmd).await?;
        if !output.success() {
            let sanitized = Self::scrub_credentials(&output.stderr.replace(repo_url, "[REPO_URL]"));
            return Err(DriverError::command_failed(
                format!("git clone ({})", sanitized.trim()),
                output.status,
            ));
        }

        Ok(())
    }

    async fn head_revision(&self, repo_dir: &Path) -> Result<String> {
        let cmd = CommandSpec::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(repo_dir);

        let output = self.runner.output(&cmd).await?;
        if !output.success() {
            return Err(DriverError::command_failed("git rev-parse HEAD", output.status));
        }
        Ok(output.stdout.trim().to_string())
    }
}
