// src/sys/suite.rs

use async_trait::async_trait;
use nix::sys::resource::{getrlimit, setrlimit, Resource, RLIM_INFINITY};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{CorpusSettings, DriverConfig};
use crate::error::{DriverError, Result};
use crate::sys::credentials::CredentialProvisioner;
use crate::sys::diag;
use crate::sys::exec::{run_checked, CommandSpec};
use crate::sys::traits::{AggregateTestResult, CommandRunner, ExternalOutcome, SuiteRunner};

/// Unit suite, then the external acceptance suite.
pub struct SystemSuiteRunner {
    runner: Arc<dyn CommandRunner>,
    credentials: Arc<CredentialProvisioner>,
    corpus: CorpusSettings,
    jobs: NonZeroUsize,
}

impl SystemSuiteRunner {
    pub fn new(
        config: &DriverConfig,
        runner: Arc<dyn CommandRunner>,
        credentials: Arc<CredentialProvisioner>,
    ) -> Self {
        Self {
            runner,
            credentials,
            corpus: config.corpus.clone(),
            jobs: config.test_jobs,
        }
    }

    /// Runs the unit suite and returns its status. A failure here must not
    /// stop the external suite, so even a spawn error becomes a status.
    async fn run_unit_suite(&self) -> i32 {
        banner("Running unit tests");

        // 🛡️ Explicit job count: left unset, the CI worker would pick a huge value.
        let btest = CommandSpec::new(self.corpus.btest.as_str())
            .args(["-j".to_string(), self.jobs.to_string(), "-d".to_string()])
            .current_dir(&self.corpus.unit_dir);

        match self.runner.status(&btest).await {
            Ok(status) => status,
            Err(e) => {
                error!(error = %e, "unit test suite could not be started");
                127
            }
        }
    }

    async fn prepare_corpora(&self) -> Result<()> {
        banner("Getting external tests");

        if !self.corpus.public_dir().exists() {
            let init = CommandSpec::new("make")
                .arg("init")
                .current_dir(&self.corpus.external_dir);
            run_checked(self.runner.as_ref(), "make init", &init).await?;
        }

        let private_dir = self.corpus.private_dir();
        if !private_dir.exists() {
            let outcome = self.credentials.fetch_private_corpus(&private_dir).await?;
            debug!(?outcome, "private corpus");
        }
        Ok(())
    }

    async fn run_external_suite(&self) -> ExternalOutcome {
        banner("Running external tests");

        let make = CommandSpec::new("make").current_dir(&self.corpus.external_dir);
        match self.runner.status(&make).await {
            Ok(0) => return ExternalOutcome::Pass,
            Ok(status) => warn!(status, "external test suite failed"),
            // The unit status is already captured; a harness that cannot start is a failed suite.
            Err(e) => error!(error = %e, "external test suite could not be started"),
        }

        let mut stdout = std::io::stdout();
        let failure = match diag::showdiag(&self.corpus.diag_log(), &mut stdout).await {
            Err(e) => e,
            Ok(never) => match never {},
        };
        error!(error = %failure, "external tests reported failures");
        ExternalOutcome::Fail
    }
}

#[async_trait]
impl SuiteRunner for SystemSuiteRunner {
    async fn run(&self) -> Result<AggregateTestResult> {
        raise_core_limit();

        let unit_status = self.run_unit_suite().await;
        if unit_status != 0 {
            warn!(status = unit_status, "unit test suite failed; continuing with external tests");
        }

        self.prepare_corpora().await?;
        let external = self.run_external_suite().await;

        let result = AggregateTestResult {
            unit_status,
            external,
        };
        info!(unit_status, ?external, exit_code = result.exit_code(), "test step finished");
        Ok(result)
    }
}

/// Allows unlimited core dumps for the suites, for post-mortem debugging.
/// Falls back to the hard limit when unprivileged.
fn raise_core_limit() {
    if setrlimit(Resource::RLIMIT_CORE, RLIM_INFINITY, RLIM_INFINITY).is_ok() {
        return;
    }
    match getrlimit(Resource::RLIMIT_CORE) {
        Ok((_, hard)) => {
            if let Err(e) = setrlimit(Resource::RLIMIT_CORE, hard, hard) {
                debug!(error = %e, "could not raise core dump limit");
            }
        }
        Err(e) => debug!(error = %e, "could not read core dump limit"),
    }
}

fn banner(title: &str) {
    println!();
    println!("{} {}", title, "#".repeat(70usize.saturating_sub(title.len())));
    println!();
}

/// A non-zero aggregate becomes a step failure carrying that exit code.
pub fn into_step_result(result: AggregateTestResult) -> Result<()> {
    match result.exit_code() {
        0 => Ok(()),
        code => Err(DriverError::command_failed("test step", code)),
    }
}
