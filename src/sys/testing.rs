// src/sys/testing.rs
//
// Recording fakes for the process and network seams.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{DriverError, Result};
use crate::sys::exec::{CommandOutput, CommandSpec};
use crate::sys::traits::{CommandRunner, FetchRequest, ScanSubmission, Transfer};

#[derive(Debug, Clone)]
pub struct Recorded {
    /// Command line with secrets exposed.
    pub line: String,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Absolute paths named by the arguments or env values that existed at call time.
    pub existing: Vec<PathBuf>,
}

impl Recorded {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

struct Rule {
    prefix: String,
    status: i32,
    stdout: String,
    creates: Option<PathBuf>,
    spawn_error: bool,
}

/// Answers commands by command-line prefix; the first matching rule wins and
/// anything unmatched exits 0.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Vec<Rule>,
    calls: Mutex<Vec<Recorded>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(mut self, prefix: &str, status: i32, stdout: &str, creates: Option<PathBuf>) -> Self {
        self.rules.push(Rule {
            prefix: prefix.to_string(),
            status,
            stdout: stdout.to_string(),
            creates,
            spawn_error: false,
        });
        self
    }

    pub fn on(self, prefix: &str, status: i32) -> Self {
        self.rule(prefix, status, "", None)
    }

    pub fn stdout(self, prefix: &str, text: &str) -> Self {
        self.rule(prefix, 0, text, None)
    }

    /// Creates directory `path` when a matching command runs.
    pub fn creates(self, prefix: &str, path: impl Into<PathBuf>) -> Self {
        self.rule(prefix, 0, "", Some(path.into()))
    }

    /// Matching commands fail to start, as if the program were missing.
    pub fn spawn_error(mut self, prefix: &str) -> Self {
        self = self.rule(prefix, 0, "", None);
        if let Some(rule) = self.rules.last_mut() {
            rule.spawn_error = true;
        }
        self
    }

    pub fn calls(&self) -> Vec<Recorded> {
        self.calls.lock().unwrap().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.line).collect()
    }

    pub fn find(&self, prefix: &str) -> Option<Recorded> {
        self.calls().into_iter().find(|c| c.line.starts_with(prefix))
    }

    fn respond(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let mut line = cmd.program().to_string();
        for arg in cmd.arg_list() {
            line.push(' ');
            line.push_str(arg.expose());
        }
        let env: Vec<(String, String)> = cmd
            .env_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let existing = line
            .split_whitespace()
            .chain(env.iter().flat_map(|(_, v)| v.split_whitespace()))
            .map(PathBuf::from)
            .filter(|p| p.is_absolute() && p.exists())
            .collect();

        self.calls.lock().unwrap().push(Recorded {
            line: line.clone(),
            cwd: cmd.cwd().map(Path::to_path_buf),
            env,
            existing,
        });

        match self.rules.iter().find(|r| line.starts_with(&r.prefix)) {
            Some(rule) if rule.spawn_error => Err(DriverError::Spawn {
                program: cmd.program().to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
            Some(rule) => {
                if let Some(dir) = &rule.creates {
                    std::fs::create_dir_all(dir).unwrap();
                }
                Ok(CommandOutput {
                    status: rule.status,
                    stdout: rule.stdout.clone(),
                    stderr: String::new(),
                })
            }
            None => Ok(CommandOutput::default()),
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn status(&self, cmd: &CommandSpec) -> Result<i32> {
        self.respond(cmd).map(|out| out.status)
    }

    async fn output(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        self.respond(cmd)
    }
}

#[derive(Debug, Clone)]
pub struct RecordedSubmission {
    pub url: String,
    pub token: String,
    pub email: String,
    pub version: String,
    pub description: String,
    pub archive: PathBuf,
}

/// Writes a fixed body for every fetch and records submissions.
#[derive(Default)]
pub struct FakeTransfer {
    pub body: Vec<u8>,
    pub fail: bool,
    fetched: Mutex<Vec<(String, Vec<String>)>>,
    submitted: Mutex<Vec<RecordedSubmission>>,
}

impl FakeTransfer {
    pub fn with_body(body: &[u8]) -> Self {
        Self {
            body: body.to_vec(),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Fetched URLs with the names of their form fields.
    pub fn fetched(&self) -> Vec<(String, Vec<String>)> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn submitted(&self) -> Vec<RecordedSubmission> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transfer for FakeTransfer {
    async fn fetch(&self, request: &FetchRequest, dest: &Path) -> Result<()> {
        self.fetched.lock().unwrap().push((
            request.url.clone(),
            request.form.iter().map(|(k, _)| k.clone()).collect(),
        ));
        if self.fail {
            return Err(DriverError::Transfer(format!("{} unreachable", request.url)));
        }
        tokio::fs::write(dest, &self.body).await?;
        Ok(())
    }

    async fn submit(&self, submission: &ScanSubmission) -> Result<String> {
        self.submitted.lock().unwrap().push(RecordedSubmission {
            url: submission.url.clone(),
            token: submission.token.expose_secret().clone(),
            email: submission.email.clone(),
            version: submission.version.clone(),
            description: submission.description.clone(),
            archive: submission.archive.clone(),
        });
        if self.fail {
            return Err(DriverError::Transfer("upload rejected".into()));
        }
        Ok("Build successfully submitted.".into())
    }
}

/// Driver configuration rooted at `workspace`, with `extra` settings applied.
pub fn test_config(workspace: &Path, extra: &[(&str, &str)]) -> crate::config::DriverConfig {
    let vars: std::collections::HashMap<String, String> = extra
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let profiles = crate::config::ProfileTable::builtin().unwrap();
    crate::config::DriverConfig::load(&|name| vars.get(name).cloned(), workspace, profiles).unwrap()
}
