//! HTTP upload client: one multipart POST per job

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::pool::{UploadJob, Uploaded, Uploader};
use crate::protocol::field;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to upload file: {status}: {body}")]
    Rejected { status: StatusCode, body: String },
}

/// Daemon response to an accepted upload
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub target: String,
    pub bytes: u64,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct UploadClient {
    http: reqwest::Client,
    endpoint: Url,
    token: Option<String>,
}

impl UploadClient {
    pub fn new(endpoint: Url, token: Option<String>, timeout: Duration) -> Result<Self, UploadError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Upload the job's file. Only `200 OK` counts as success.
    ///
    /// The file is streamed from an open handle owned by the request body;
    /// it is closed when the request finishes or fails.
    pub async fn upload(&self, job: &UploadJob) -> Result<UploadReceipt, UploadError> {
        let file = tokio::fs::File::open(&job.absolute_path)
            .await
            .map_err(|source| UploadError::Open {
                path: job.absolute_path.clone(),
                source,
            })?;
        let bytes = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        let target = job.target_path();
        info!(target = %target, "uploading file");

        let mut form = Form::new()
            .part(field::FILE, Part::stream(Body::from(file)).file_name(job.file_name()))
            .text(field::TARGET, target.clone());
        if let Some(token) = &self.token {
            form = form.text(field::TOKEN, token.clone());
        }

        let resp = self
            .http
            .post(self.endpoint.clone())
            .multipart(form)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status != StatusCode::OK {
            return Err(UploadError::Rejected {
                status,
                body: body.trim().to_string(),
            });
        }
        Ok(UploadReceipt {
            target,
            bytes,
            message: body.trim().to_string(),
        })
    }
}

#[async_trait]
impl Uploader for UploadClient {
    async fn upload(&self, job: &UploadJob) -> anyhow::Result<Uploaded> {
        let receipt = UploadClient::upload(self, job).await?;
        Ok(Uploaded {
            bytes: receipt.bytes,
        })
    }
}
