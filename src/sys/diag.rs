// src/sys/diag.rs

use std::convert::Infallible;
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{DriverError, Result};

pub const FAILED_MARKER: &str = "... failed";
pub const SKIPPED_MARKER: &str = "... not available, skipped";

const HEADER: &str = "Output of failed external tests #################################";

/// Builds the report for a diagnostic log, or `None` when no test failed.
/// Skipped-test lines are left out of the report.
pub fn render(log: &str) -> Option<String> {
    if !log.lines().any(|line| line.trim_end().ends_with(FAILED_MARKER)) {
        return None;
    }

    let mut report = format!("{}\n\n", HEADER);
    for line in log.lines().filter(|line| !line.contains(SKIPPED_MARKER)) {
        report.push_str(line);
        report.push('\n');
    }
    Some(report)
}

/// Prints the failed external tests from `log_path` to `out`.
///
/// Only reached after the external harness reported failure, so it never
/// returns successfully: the `Ok` side is uninhabited.
pub async fn showdiag(log_path: &Path, out: &mut (dyn Write + Send)) -> Result<Infallible> {
    match tokio::fs::read_to_string(log_path).await {
        Ok(log) => match render(&log) {
            Some(report) => {
                if let Err(e) = out.write_all(report.as_bytes()).and_then(|_| out.flush()) {
                    warn!(error = %e, "failed to print diagnostic report");
                }
            }
            None => debug!(log = %log_path.display(), "no failed tests in diagnostic log"),
        },
        Err(e) => debug!(log = %log_path.display(), error = %e, "diagnostic log unavailable"),
    }

    Err(DriverError::ExternalSuiteFailed)
}
