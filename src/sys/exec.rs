// src/sys/exec.rs

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::error::{DriverError, Result};
use crate::sys::traits::CommandRunner;

/// One command-line argument. Secret arguments are passed to the child but
/// never rendered.
pub enum Arg {
    Plain(String),
    Secret(SecretString),
}

impl Arg {
    pub fn expose(&self) -> &str {
        match self {
            Arg::Plain(s) => s.as_str(),
            Arg::Secret(s) => s.expose_secret().as_str(),
        }
    }
}

/// A fully described invocation of a delegated tool.
pub struct CommandSpec {
    program: String,
    args: Vec<Arg>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    secret_env: Vec<(String, SecretString)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            secret_env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(Arg::Plain(arg.into()));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|a| Arg::Plain(a.into())));
        self
    }

    pub fn secret_arg(mut self, arg: SecretString) -> Self {
        self.args.push(Arg::Secret(arg));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn secret_env(mut self, key: impl Into<String>, value: SecretString) -> Self {
        self.secret_env.push((key.into(), value));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arg_list(&self) -> &[Arg] {
        &self.args
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// All environment pairs, secrets exposed. Only for handing to a child process.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .chain(
                self.secret_env
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.expose_secret().as_str())),
            )
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().map(Arg::expose));
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(self.env_pairs());
        cmd
    }
}

/// Renders the command line with secret arguments redacted.
impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            match arg {
                Arg::Plain(s) => write!(f, " {}", s)?,
                Arg::Secret(_) => f.write_str(" [REDACTED]")?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_keys: Vec<&str> = self
            .env
            .iter()
            .map(|(k, _)| k.as_str())
            .chain(self.secret_env.iter().map(|(k, _)| k.as_str()))
            .collect();
        f.debug_struct("CommandSpec")
            .field("command", &self.to_string())
            .field("cwd", &self.cwd)
            .field("env", &env_keys)
            .finish()
    }
}

/// Captured result of a command run with `output`.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs commands on the host through tokio. Output of `status` calls goes
/// straight to the CI log; `output` calls capture it.
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn status(&self, cmd: &CommandSpec) -> Result<i32> {
        debug!(command = %cmd, cwd = ?cmd.cwd(), "running");

        let status = cmd
            .to_command()
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|source| DriverError::Spawn {
                program: cmd.program().to_string(),
                source,
            })?;

        // A child killed by a signal has no code.
        Ok(status.code().unwrap_or(1))
    }

    async fn output(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %cmd, cwd = ?cmd.cwd(), "running (captured)");

        let output = cmd
            .to_command()
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| DriverError::Spawn {
                program: cmd.program().to_string(),
                source,
            })?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Runs `cmd` and turns a non-zero status into `CommandFailed`.
pub async fn run_checked(runner: &dyn CommandRunner, what: &str, cmd: &CommandSpec) -> Result<()> {
    match runner.status(cmd).await? {
        0 => Ok(()),
        code => Err(DriverError::command_failed(what, code)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;

    #[test]
    fn display_redacts_secret_arguments() {
        let cmd = CommandSpec::new("openssl")
            .args(["aes-256-cbc", "-K"])
            .secret_arg(Secret::new("deadbeef".to_string()))
            .arg("-d");
        assert_eq!(cmd.to_string(), "openssl aes-256-cbc -K [REDACTED] -d");
        assert!(!format!("{:?}", cmd).contains("deadbeef"));
    }

    #[test]
    fn debug_lists_env_names_only() {
        let cmd = CommandSpec::new("docker")
            .env("TRAVIS", "true")
            .secret_env("trav_key", Secret::new("deadbeef".to_string()));
        let rendered = format!("{:?}", cmd);
        assert!(rendered.contains("trav_key"));
        assert!(!rendered.contains("deadbeef"));
        let pairs: Vec<_> = cmd.env_pairs().collect();
        assert_eq!(pairs, vec![("TRAVIS", "true"), ("trav_key", "deadbeef")]);
    }

    #[tokio::test]
    async fn status_reports_exit_codes() {
        let runner = SystemCommandRunner;
        assert_eq!(runner.status(&CommandSpec::new("true")).await.unwrap(), 0);
        let code = runner
            .status(&CommandSpec::new("sh").args(["-c", "exit 3"]))
            .await
            .unwrap();
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn output_captures_stdout_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = SystemCommandRunner
            .output(&CommandSpec::new("pwd").current_dir(dir.path()))
            .await
            .unwrap();
        assert!(out.success());
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(out.stdout.trim(), expected.to_str().unwrap());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = SystemCommandRunner
            .status(&CommandSpec::new("definitely-not-a-real-tool-4242"))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Spawn { .. }));
    }

    #[tokio::test]
    async fn run_checked_maps_failure() {
        let err = run_checked(&SystemCommandRunner, "false", &CommandSpec::new("false"))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}
