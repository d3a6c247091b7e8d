pub mod config;
pub mod dispatch;
pub mod handler;
pub mod logging;
pub mod persistence;
pub mod profile;
pub mod queue;
pub mod settlement;
pub mod supabase;

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::time::sleep;

use crate::handler::{JobOutcome, JobReport, Pipeline, SettlementStatus};
use crate::queue::{JobQueue, QueueError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// How long a fetched job stays hidden from other consumers.
    pub visibility_timeout: Duration,
    pub batch_size: usize,
    /// Sleep after an empty batch or a failed fetch.
    pub idle_backoff: Duration,
    /// Upper bound on jobs of one batch in flight at once.
    pub max_concurrency: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            batch_size: 1,
            idle_backoff: Duration::from_secs(5),
            max_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub jobs: Vec<JobReport>,
}

impl BatchReport {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn count(&self, outcome: JobOutcome) -> usize {
        self.jobs.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn settlements(&self, status: SettlementStatus) -> usize {
        self.jobs.iter().filter(|r| r.settlement == status).count()
    }
}

pub struct Worker {
    queue: Arc<dyn JobQueue>,
    pipeline: Pipeline,
    config: ConsumerConfig,
}

impl Worker {
    /// Zero `batch_size` or `max_concurrency` is raised to one.
    pub fn new(queue: Arc<dyn JobQueue>, pipeline: Pipeline, config: ConsumerConfig) -> Arc<Self> {
        let config = ConsumerConfig {
            batch_size: config.batch_size.max(1),
            max_concurrency: config.max_concurrency.max(1),
            ..config
        };
        Arc::new(Self {
            queue,
            pipeline,
            config,
        })
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Fetches one batch and runs every job in it to completion, at most
    /// `max_concurrency` at a time. Jobs in a batch are unordered.
    pub async fn poll_once(&self) -> Result<BatchReport, QueueError> {
        let jobs = self
            .queue
            .read(self.config.visibility_timeout, self.config.batch_size)
            .await?;

        if jobs.is_empty() {
            return Ok(BatchReport::default());
        }
        tracing::debug!(count = jobs.len(), "fetched batch");

        let jobs: Vec<JobReport> = stream::iter(jobs)
            .map(|job| self.pipeline.process(job))
            .buffer_unordered(self.config.max_concurrency)
            .collect()
            .await;

        Ok(BatchReport { jobs })
    }

    /// Polls until `shutdown` flips to true. A batch already in flight is
    /// finished before returning; fetch errors never stop the loop.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            batch_size = self.config.batch_size,
            visibility_timeout_secs = self.config.visibility_timeout.as_secs(),
            "queue consumer started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.poll_once().await {
                Ok(report) if report.is_empty() => {
                    tracing::debug!("no jobs found");
                    true
                }
                Ok(report) => {
                    tracing::info!(
                        fetched = report.jobs.len(),
                        completed = report.count(JobOutcome::Completed),
                        left_in_queue = report.jobs.len() - report.count(JobOutcome::Completed),
                        settlement_failures = report.settlements(SettlementStatus::Failed),
                        "batch finished"
                    );
                    false
                }
                Err(e) => {
                    tracing::warn!(error = %e, "queue fetch failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = sleep(self.config.idle_backoff) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("queue consumer stopped");
    }
}
