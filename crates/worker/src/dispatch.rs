use async_trait::async_trait;
use dart_core::job::Job;
use reqwest::Client;

use crate::supabase::into_success;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("processing api request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("processing api returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// The processing API. Every error is retryable: the job stays queued and is
/// redelivered after its visibility timeout.
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn dispatch(&self, job: &Job) -> Result<(), DispatchError>;
}

pub struct HttpDownstream {
    endpoint: String,
    http: Client,
}

impl HttpDownstream {
    pub fn new(api_url: &str, http: Client) -> Self {
        Self {
            endpoint: format!("{}/darts", api_url.trim_end_matches('/')),
            http,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Downstream for HttpDownstream {
    async fn dispatch(&self, job: &Job) -> Result<(), DispatchError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&job.message)
            .send()
            .await?;

        let response = into_success(response)
            .await
            .map_err(|(status, body)| DispatchError::Status {
                status: status.as_u16(),
                body,
            })?;

        tracing::debug!(
            job_id = %job.id(),
            status = response.status().as_u16(),
            "processing api accepted job"
        );
        Ok(())
    }
}
