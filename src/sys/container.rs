// src/sys/container.rs

use async_trait::async_trait;
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{DriverConfig, PlatformProfile};
use crate::error::{DriverError, Result};
use crate::sys::exec::{run_checked, CommandSpec};
use crate::sys::traits::{CommandRunner, EnvironmentHandle, EnvironmentManager};

/// Manages the single build container through the docker CLI.
pub struct DockerEnvironmentManager {
    runner: Arc<dyn CommandRunner>,
    name: String,
    workspace: PathBuf,
    mount_path: String,
}

impl DockerEnvironmentManager {
    pub fn new(config: &DriverConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            name: config.container_name.clone(),
            workspace: config.workspace.clone(),
            mount_path: config.mount_path.clone(),
        }
    }
}

#[async_trait]
impl EnvironmentManager for DockerEnvironmentManager {
    async fn create(&self, profile: &PlatformProfile) -> Result<EnvironmentHandle> {
        // 🛡️ Input validation: the name ends up in an image reference.
        if profile.name.is_empty() || profile.name.starts_with('-') {
            return Err(DriverError::UnknownProfile(profile.name.clone()));
        }

        let image = profile.image();
        info!(container = %self.name, %image, "starting build container");

        // The working tree is mounted read-write; build output lands in the checkout.
        let start = CommandSpec::new("docker")
            .args(["run", "--name", self.name.as_str(), "-id", "-v"])
            .arg(format!("{}:{}", self.workspace.display(), self.mount_path))
            .args(["-w", self.mount_path.as_str()])
            .arg(image)
            .arg("sh");
        run_checked(self.runner.as_ref(), "docker run", &start).await?;

        let handle = EnvironmentHandle {
            name: self.name.clone(),
        };

        info!(container = %self.name, profile = %profile.name, "installing prerequisites");
        let install = CommandSpec::new("docker")
            .args(["exec", self.name.as_str(), "sh", "-c"])
            .arg(profile.install_script());
        run_checked(self.runner.as_ref(), "prerequisite install", &install).await?;

        Ok(handle)
    }

    fn attach(&self) -> EnvironmentHandle {
        EnvironmentHandle {
            name: self.name.clone(),
        }
    }

    async fn exec(
        &self,
        handle: &EnvironmentHandle,
        argv: &[String],
        forward: Vec<(String, SecretString)>,
    ) -> Result<i32> {
        let mut cmd = CommandSpec::new("docker").arg("exec");

        // 🛡️ Zero-Leak forwarding: only `-e NAME` appears on the argv. Docker
        // copies the value from its own environment, which we set privately.
        for (name, _) in &forward {
            cmd = cmd.args(["-e", name.as_str()]);
        }
        cmd = cmd.arg(&handle.name).args(argv.iter().cloned());
        for (name, value) in forward {
            cmd = cmd.secret_env(name, value);
        }

        info!(container = %handle.name, command = %argv.join(" "), "exec in container");
        self.runner.status(&cmd).await
    }

    async fn destroy(&self, handle: &EnvironmentHandle) {
        for action in ["stop", "rm"] {
            let cmd = CommandSpec::new("docker").args([action, handle.name.as_str()]);
            match self.runner.output(&cmd).await {
                Ok(out) if out.success() => {}
                Ok(out) => warn!(
                    container = %handle.name,
                    status = out.status,
                    stderr = %out.stderr.trim(),
                    "docker {} failed; continuing", action
                ),
                Err(e) => warn!(container = %handle.name, error = %e, "docker {} failed; continuing", action),
            }
        }
        info!(container = %handle.name, "container removed");
    }
}

/// Owns a container for the duration of a composite run.
///
/// Released only on success. Dropping an unreleased lease leaves the
/// container running so it can be inspected after a failure.
pub struct ContainerLease<'a> {
    manager: &'a dyn EnvironmentManager,
    handle: EnvironmentHandle,
    armed: bool,
}

impl<'a> ContainerLease<'a> {
    pub fn new(manager: &'a dyn EnvironmentManager, handle: EnvironmentHandle) -> Self {
        Self {
            manager,
            handle,
            armed: true,
        }
    }

    pub fn handle(&self) -> &EnvironmentHandle {
        &self.handle
    }

    pub async fn release(mut self) {
        self.armed = false;
        self.manager.destroy(&self.handle).await;
    }
}

impl Drop for ContainerLease<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                container = %self.handle.name,
                "leaving container running for inspection (remove with: docker rm -f {})",
                self.handle.name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfileTable;
    use crate::sys::testing::{test_config, ScriptedRunner};
    use secrecy::Secret;
    use std::path::Path;

    fn manager(runner: Arc<ScriptedRunner>) -> DockerEnvironmentManager {
        let config = test_config(Path::new("/src/bro"), &[]);
        DockerEnvironmentManager::new(&config, runner)
    }

    fn centos() -> PlatformProfile {
        ProfileTable::builtin().unwrap().get("centos_7").unwrap().clone()
    }

    #[tokio::test]
    async fn create_mounts_tree_and_installs_prerequisites() {
        let runner = Arc::new(ScriptedRunner::new());
        let handle = manager(runner.clone()).create(&centos()).await.unwrap();
        assert_eq!(handle.name, "brotest");

        let lines = runner.lines();
        assert_eq!(
            lines[0],
            "docker run --name brotest -id -v /src/bro:/bro -w /bro centos:7 sh"
        );
        assert!(lines[1].starts_with("docker exec brotest sh -c yum -y install gdb cmake"));
    }

    #[tokio::test]
    async fn create_stops_when_container_fails_to_start() {
        let runner = Arc::new(ScriptedRunner::new().on("docker run", 125));
        let err = manager(runner.clone()).create(&centos()).await.unwrap_err();
        assert_eq!(err.exit_code(), 125);
        assert_eq!(runner.lines().len(), 1);
    }

    #[tokio::test]
    async fn exec_forwards_names_not_values() {
        let runner = Arc::new(ScriptedRunner::new().on("docker exec", 4));
        let mgr = manager(runner.clone());
        let argv = vec!["testing/scripts/ci-driver".to_string(), "run".into(), "bare-host".into()];
        let forward = vec![
            ("TRAVIS".to_string(), Secret::new("true".to_string())),
            ("trav_key".to_string(), Secret::new("deadbeef".to_string())),
        ];

        let status = mgr.exec(&mgr.attach(), &argv, forward).await.unwrap();
        assert_eq!(status, 4);

        let call = runner.find("docker exec").unwrap();
        assert_eq!(
            call.line,
            "docker exec -e TRAVIS -e trav_key brotest testing/scripts/ci-driver run bare-host"
        );
        assert_eq!(call.env_value("trav_key"), Some("deadbeef"));
    }

    #[tokio::test]
    async fn exec_without_forwarding_sets_no_env() {
        let runner = Arc::new(ScriptedRunner::new());
        let mgr = manager(runner.clone());
        mgr.exec(&mgr.attach(), &["true".to_string()], Vec::new())
            .await
            .unwrap();
        assert!(runner.calls()[0].env.is_empty());
    }

    #[tokio::test]
    async fn destroy_tolerates_missing_container() {
        let runner = Arc::new(ScriptedRunner::new().on("docker stop", 1).on("docker rm", 1));
        let mgr = manager(runner.clone());
        mgr.destroy(&mgr.attach()).await;
        assert_eq!(runner.lines(), vec!["docker stop brotest", "docker rm brotest"]);
    }

    #[tokio::test]
    async fn dropped_lease_keeps_container() {
        let runner = Arc::new(ScriptedRunner::new());
        let mgr = manager(runner.clone());
        {
            let _lease = ContainerLease::new(&mgr, mgr.attach());
        }
        assert!(runner.calls().is_empty());

        let lease = ContainerLease::new(&mgr, mgr.attach());
        assert_eq!(lease.handle().name, "brotest");
        lease.release().await;
        assert_eq!(runner.lines().len(), 2);
    }
}
