use std::time::Duration;

use async_trait::async_trait;
use dart_core::ids::JobId;
use dart_core::job::Job;
use serde_json::{json, Value};

use crate::supabase::{into_success, SupabaseRest};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("queue rpc returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected queue response: {0}")]
    Decode(String),

    #[error("message {0} not found in queue")]
    NotFound(JobId),
}

/// At-least-once queue. A read hides the returned messages for the visibility
/// timeout; anything not deleted before it elapses is handed out again.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn read(
        &self,
        visibility_timeout: Duration,
        max_count: usize,
    ) -> Result<Vec<Job>, QueueError>;

    async fn delete(&self, id: JobId) -> Result<(), QueueError>;
}

/// Queue exposed through the `read_from_queue` / `delete_from_queue` RPCs.
pub struct SupabaseQueue {
    rest: SupabaseRest,
    queue_name: String,
}

impl SupabaseQueue {
    pub fn new(rest: SupabaseRest, queue_name: impl Into<String>) -> Self {
        Self {
            rest,
            queue_name: queue_name.into(),
        }
    }
}

#[async_trait]
impl JobQueue for SupabaseQueue {
    async fn read(
        &self,
        visibility_timeout: Duration,
        max_count: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let response = self
            .rest
            .rpc("read_from_queue")
            .json(&json!({
                "queue_name": self.queue_name,
                "vt": visibility_timeout.as_secs(),
                "qty": max_count,
            }))
            .send()
            .await?;
        let response = into_success(response)
            .await
            .map_err(|(status, body)| QueueError::Status {
                status: status.as_u16(),
                body,
            })?;

        let rows: Option<Vec<Value>> = response.json().await?;

        let mut jobs = Vec::new();
        for row in rows.unwrap_or_default() {
            let msg_id = row.get("msg_id").cloned();
            match serde_json::from_value::<Job>(row) {
                Ok(job) => jobs.push(job),
                // Left in the queue; it will keep resurfacing until fixed by hand.
                Err(e) => tracing::warn!(?msg_id, error = %e, "skipping malformed queue message"),
            }
        }
        Ok(jobs)
    }

    async fn delete(&self, id: JobId) -> Result<(), QueueError> {
        let response = self
            .rest
            .rpc("delete_from_queue")
            .json(&json!({
                "queue_name": self.queue_name,
                "msg_id": id,
            }))
            .send()
            .await?;
        let response = into_success(response)
            .await
            .map_err(|(status, body)| QueueError::Status {
                status: status.as_u16(),
                body,
            })?;

        let body = response.text().await?;
        match serde_json::from_str::<Value>(&body) {
            Ok(Value::Bool(false)) => Err(QueueError::NotFound(id)),
            Ok(_) => Ok(()),
            Err(_) if body.trim().is_empty() => Ok(()),
            Err(e) => Err(QueueError::Decode(e.to_string())),
        }
    }
}
