// src/sys/build.rs

use async_trait::async_trait;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::DriverConfig;
use crate::error::Result;
use crate::sys::exec::{run_checked, CommandSpec};
use crate::sys::traits::{BuildManager, BuildProfile, CommandRunner};

// Broker tests, python bindings and broctl are not needed by any test suite.
const COMPONENT_EXCLUSIONS: [&str; 3] = ["--disable-broker-tests", "--disable-python", "--disable-broctl"];

impl BuildProfile {
    pub fn configure_flags(&self, workspace: &Path) -> Vec<String> {
        let mut flags: Vec<String> = match self {
            BuildProfile::Standard => vec!["--build-type=Release".into()],
            BuildProfile::Instrumented => vec![
                format!("--prefix={}", workspace.join("build/root").display()),
                "--enable-debug".into(),
                "--disable-perftools".into(),
            ],
        };
        flags.extend(COMPONENT_EXCLUSIONS.iter().map(|f| f.to_string()));
        flags
    }
}

pub struct SystemBuildManager {
    runner: Arc<dyn CommandRunner>,
    workspace: PathBuf,
    build_dir: PathBuf,
    jobs: NonZeroUsize,
    scan_jobs: NonZeroUsize,
    tools_bin: PathBuf,
    search_path: String,
    intermediate_dir: String,
}

impl SystemBuildManager {
    pub fn new(config: &DriverConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            workspace: config.workspace.clone(),
            build_dir: config.build_dir(),
            jobs: config.build_jobs,
            scan_jobs: config.scan_jobs,
            tools_bin: config.scan.tools_dir.join("bin"),
            search_path: config.search_path.clone(),
            intermediate_dir: config.scan.intermediate_dir.clone(),
        }
    }

    /// Clears a previous build. A fresh checkout has nothing to clean, so a
    /// failure here is expected and ignored.
    async fn distclean(&self) {
        let clean = CommandSpec::new("make")
            .arg("distclean")
            .current_dir(&self.workspace);
        match self.runner.output(&clean).await {
            Ok(out) if !out.success() => debug!(status = out.status, "nothing to clean"),
            Err(e) => debug!(error = %e, "make distclean unavailable"),
            Ok(_) => {}
        }
    }
}

#[async_trait]
impl BuildManager for SystemBuildManager {
    async fn build(&self, profile: BuildProfile) -> Result<()> {
        info!(?profile, "building");
        self.distclean().await;

        let configure = CommandSpec::new("./configure")
            .args(profile.configure_flags(&self.workspace))
            .current_dir(&self.workspace);
        run_checked(self.runner.as_ref(), "configure", &configure).await?;

        match profile {
            BuildProfile::Standard => {
                let make = CommandSpec::new("make")
                    .args(["-j".to_string(), self.jobs.to_string()])
                    .current_dir(&self.workspace);
                run_checked(self.runner.as_ref(), "make", &make).await
            }
            BuildProfile::Instrumented => {
                // The capture tool wraps make and records every compiler call.
                let capture = CommandSpec::new(self.tools_bin.join("cov-build").to_string_lossy())
                    .args(["--dir", self.intermediate_dir.as_str(), "make", "-j"])
                    .arg(self.scan_jobs.to_string())
                    .current_dir(&self.build_dir)
                    .env(
                        "PATH",
                        format!("{}:{}", self.tools_bin.display(), self.search_path),
                    );
                run_checked(self.runner.as_ref(), "cov-build", &capture).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::testing::{test_config, ScriptedRunner};

    fn builder(runner: Arc<ScriptedRunner>) -> SystemBuildManager {
        let config = test_config(Path::new("/src/bro"), &[("PATH", "/usr/bin")]);
        SystemBuildManager::new(&config, runner)
    }

    #[test]
    fn standard_flags() {
        assert_eq!(
            BuildProfile::Standard.configure_flags(Path::new("/src")),
            vec![
                "--build-type=Release",
                "--disable-broker-tests",
                "--disable-python",
                "--disable-broctl"
            ]
        );
    }

    #[test]
    fn instrumented_flags() {
        let flags = BuildProfile::Instrumented.configure_flags(Path::new("/src"));
        assert_eq!(flags[0], "--prefix=/src/build/root");
        assert!(flags.contains(&"--enable-debug".to_string()));
        assert!(flags.contains(&"--disable-perftools".to_string()));
        assert!(flags.contains(&"--disable-broctl".to_string()));
        assert!(!flags.iter().any(|f| f.starts_with("--build-type")));
    }

    #[tokio::test]
    async fn standard_build_sequence() {
        let runner = Arc::new(ScriptedRunner::new().on("make distclean", 2));
        builder(runner.clone()).build(BuildProfile::Standard).await.unwrap();
        assert_eq!(
            runner.lines(),
            vec![
                "make distclean",
                "./configure --build-type=Release --disable-broker-tests --disable-python --disable-broctl",
                "make -j 2",
            ]
        );
    }

    #[tokio::test]
    async fn configure_failure_skips_compile() {
        let runner = Arc::new(ScriptedRunner::new().on("./configure", 1));
        let err = builder(runner.clone())
            .build(BuildProfile::Standard)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(runner.find("make -j").is_none());
    }

    #[tokio::test]
    async fn instrumented_build_runs_capture_tool_in_build_dir() {
        let runner = Arc::new(ScriptedRunner::new());
        builder(runner.clone()).build(BuildProfile::Instrumented).await.unwrap();

        let capture = runner.find("/src/bro/coverity-tools/bin/cov-build").unwrap();
        assert_eq!(
            capture.line,
            "/src/bro/coverity-tools/bin/cov-build --dir cov-int make -j 4"
        );
        assert_eq!(capture.cwd, Some(PathBuf::from("/src/bro/build")));
        assert_eq!(
            capture.env_value("PATH"),
            Some("/src/bro/coverity-tools/bin:/usr/bin")
        );
    }
}
