// src/sys/transfer.rs

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::ExposeSecret;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{DriverError, Result};
use crate::sys::traits::{FetchRequest, ScanSubmission, Transfer};

pub struct HttpTransfer {
    client: reqwest::Client,
}

impl HttpTransfer {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("bro-ci-driver/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn fetch(&self, request: &FetchRequest, dest: &Path) -> Result<()> {
        debug!(url = %request.url, dest = %dest.display(), "downloading");

        let builder = if request.form.is_empty() {
            self.client.get(&request.url)
        } else {
            // 🛡️ The form values are exposed only while the body is encoded.
            let fields: Vec<(&str, &str)> = request
                .form
                .iter()
                .map(|(k, v)| (k.as_str(), v.expose_secret().as_str()))
                .collect();
            self.client.post(&request.url).form(&fields)
        };

        let body = builder.send().await?.error_for_status()?.bytes().await?;
        tokio::fs::write(dest, &body).await?;

        info!(url = %request.url, bytes = body.len(), "download complete");
        Ok(())
    }

    async fn submit(&self, submission: &ScanSubmission) -> Result<String> {
        let archive = tokio::fs::read(&submission.archive).await?;
        let file_name = submission
            .archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| DriverError::MissingArtifact(submission.archive.display().to_string()))?;

        let form = Form::new()
            .text("token", submission.token.expose_secret().clone())
            .text("email", submission.email.clone())
            .part("file", Part::bytes(archive).file_name(file_name))
            .text("version", submission.version.clone())
            .text("description", submission.description.clone());

        let response = self
            .client
            .post(&submission.url)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.text().await?)
    }
}
