use std::sync::Arc;

use dart_core::ids::JobId;
use dart_core::job::Job;

use crate::dispatch::Downstream;
use crate::profile::ProfileStore;
use crate::queue::JobQueue;
use crate::settlement::{SettlementOutcome, TokenSettlement};

/// Where a job ended up after one pass through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Dispatched and deleted from the queue.
    Completed,
    /// Profile lookup failed; nothing else ran and the job stays queued.
    ProfileUnavailable,
    /// The processing API rejected the job; it stays queued for redelivery.
    DispatchFailed,
    /// Dispatched, but the delete failed. The job will be redelivered and
    /// dispatched again.
    DeleteFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementStatus {
    /// The profile carries no custodial key, or the profile was never read.
    NotAttempted,
    Settled,
    AlreadySettled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: JobId,
    pub outcome: JobOutcome,
    pub settlement: SettlementStatus,
}

/// profile → settlement → dispatch → delete, for one job at a time.
///
/// Settlement failures do not block dispatch: the job is still forwarded,
/// without `tokenTransactions`. Anything short of a successful dispatch leaves
/// the job in the queue, and redelivery after the visibility timeout is the
/// only retry.
pub struct Pipeline {
    profiles: Arc<dyn ProfileStore>,
    settlement: Arc<TokenSettlement>,
    downstream: Arc<dyn Downstream>,
    queue: Arc<dyn JobQueue>,
}

impl Pipeline {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        settlement: Arc<TokenSettlement>,
        downstream: Arc<dyn Downstream>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            profiles,
            settlement,
            downstream,
            queue,
        }
    }

    pub fn settlement(&self) -> &Arc<TokenSettlement> {
        &self.settlement
    }

    pub async fn process(&self, mut job: Job) -> JobReport {
        let job_id = job.id();
        let report = |outcome, settlement| JobReport {
            job_id,
            outcome,
            settlement,
        };

        let profile = match self.profiles.profile(&job.message.author).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(
                    %job_id,
                    author = %job.message.author,
                    error = %e,
                    "profile lookup failed, leaving job queued"
                );
                return report(JobOutcome::ProfileUnavailable, SettlementStatus::NotAttempted);
            }
        };

        let settlement = match profile.custodial_secret_key() {
            Some(secret_key) => self.settle(&mut job, secret_key).await,
            None => {
                tracing::debug!(%job_id, "no custodial wallet on profile, skipping settlement");
                SettlementStatus::NotAttempted
            }
        };

        if let Err(e) = self.downstream.dispatch(&job).await {
            tracing::warn!(%job_id, error = %e, "dispatch failed, job left for redelivery");
            return report(JobOutcome::DispatchFailed, settlement);
        }
        tracing::info!(%job_id, "dispatch succeeded");

        match self.queue.delete(job_id).await {
            Ok(()) => {
                tracing::info!(%job_id, "job processed and removed from queue");
                report(JobOutcome::Completed, settlement)
            }
            Err(e) => {
                tracing::error!(%job_id, error = %e, "failed to delete dispatched job");
                report(JobOutcome::DeleteFailed, settlement)
            }
        }
    }

    async fn settle(&self, job: &mut Job, secret_key: &str) -> SettlementStatus {
        let job_id = job.id();
        match self.settlement.settle(job_id, secret_key).await {
            Ok(outcome) => {
                job.attach_receipt(outcome.receipt());
                match outcome {
                    SettlementOutcome::Settled(_) => SettlementStatus::Settled,
                    SettlementOutcome::AlreadySettled(_) => SettlementStatus::AlreadySettled,
                }
            }
            Err(e) => {
                tracing::error!(%job_id, error = %e, "token settlement failed, dispatching anyway");
                SettlementStatus::Failed
            }
        }
    }
}
