//! Three-step token settlement for a job.
//!
//! 1. funder → custodial: `token_drip` tokens
//! 2. funder → custodial: `gas_drip` native currency for gas
//! 3. custodial → client contract: `client_cost` tokens
//!
//! Each step is confirmed before the next is broadcast. Per-job progress is
//! kept in a [`SettlementLedger`], so a failed settlement resumes at its first
//! unconfirmed step instead of dripping again, and a fully confirmed job is
//! never settled twice while its record is present.

use std::fmt;
use std::sync::Arc;

use alloy::primitives::{address, Address, TxHash, U256};
use contract_client::{Ledger, LedgerError, WalletCache, WalletError, WalletHandle};
use dart_core::ids::JobId;
use dart_core::job::TransferReceipt;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub const UNREAL_CLIENT_ADDRESS: Address = address!("6dAC9A69C100983915cf97C078f930501ccEE278");
/// 1.01 tokens (18 decimals).
pub const UNREAL_DRIP: U256 = U256::from_limbs([1_010_000_000_000_000_000, 0, 0, 0]);
/// 0.1 native.
pub const ETH_DRIP: U256 = U256::from_limbs([100_000_000_000_000_000, 0, 0, 0]);
/// 1 token.
pub const UNREAL_COST: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementTerms {
    pub client_address: Address,
    pub token_drip: U256,
    pub gas_drip: U256,
    pub client_cost: U256,
}

impl Default for SettlementTerms {
    fn default() -> Self {
        Self {
            client_address: UNREAL_CLIENT_ADDRESS,
            token_drip: UNREAL_DRIP,
            gas_drip: ETH_DRIP,
            client_cost: UNREAL_COST,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStep {
    DripToken,
    DripGas,
    PayClient,
}

impl fmt::Display for SettlementStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SettlementStep::DripToken => "drip-token",
            SettlementStep::DripGas => "drip-gas",
            SettlementStep::PayClient => "pay-client",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "tx_hash", rename_all = "snake_case")]
pub enum StepState {
    /// Accepted by the node, receipt not yet observed.
    Broadcast(TxHash),
    Confirmed(TxHash),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementProgress {
    pub drip_token: Option<StepState>,
    pub drip_gas: Option<StepState>,
    pub pay_client: Option<StepState>,
}

impl SettlementProgress {
    pub fn step(&self, step: SettlementStep) -> Option<StepState> {
        match step {
            SettlementStep::DripToken => self.drip_token,
            SettlementStep::DripGas => self.drip_gas,
            SettlementStep::PayClient => self.pay_client,
        }
    }

    fn set(&mut self, step: SettlementStep, state: Option<StepState>) {
        match step {
            SettlementStep::DripToken => self.drip_token = state,
            SettlementStep::DripGas => self.drip_gas = state,
            SettlementStep::PayClient => self.pay_client = state,
        }
    }

    pub fn confirmed(&self, step: SettlementStep) -> Option<TxHash> {
        match self.step(step) {
            Some(StepState::Confirmed(tx)) => Some(tx),
            _ => None,
        }
    }

    /// The settlement evidence, present once all three steps are confirmed.
    pub fn receipt(&self) -> Option<TransferReceipt> {
        self.confirmed(SettlementStep::DripGas)?;
        Some(TransferReceipt {
            funder_to_wallet_tx_hash: self.confirmed(SettlementStep::DripToken)?,
            wallet_to_client_tx_hash: self.confirmed(SettlementStep::PayClient)?,
        })
    }

    pub fn is_started(&self) -> bool {
        self.drip_token.is_some() || self.drip_gas.is_some() || self.pay_client.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub job_id: JobId,
    pub progress: SettlementProgress,
}

/// Process-wide settlement progress, keyed by job.
///
/// Progress lives in a plain map so it can be read (and snapshotted) while a
/// settlement is in flight; the per-job mutex only serializes settlements of
/// the same job.
#[derive(Default)]
pub struct SettlementLedger {
    progress: DashMap<JobId, SettlementProgress>,
    locks: DashMap<JobId, Arc<Mutex<()>>>,
}

impl SettlementLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(records: impl IntoIterator<Item = SettlementRecord>) -> Self {
        let ledger = Self::new();
        for record in records {
            ledger.progress.insert(record.job_id, record.progress);
        }
        ledger
    }

    fn job_lock(&self, job_id: JobId) -> Arc<Mutex<()>> {
        self.locks.entry(job_id).or_default().clone()
    }

    /// Drops the job's lock entry unless another settlement is holding or
    /// waiting on it. `lock` is the caller's clone, already unlocked.
    fn release_job_lock(&self, job_id: JobId, lock: Arc<Mutex<()>>) {
        self.locks.remove_if(&job_id, |_, held| {
            Arc::ptr_eq(held, &lock) && Arc::strong_count(held) == 2
        });
    }

    /// Jobs with a lock entry; only jobs being settled right now.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    pub fn progress(&self, job_id: JobId) -> Option<SettlementProgress> {
        self.progress.get(&job_id).map(|p| p.clone())
    }

    pub fn receipt(&self, job_id: JobId) -> Option<TransferReceipt> {
        self.progress.get(&job_id).and_then(|p| p.receipt())
    }

    pub fn is_settled(&self, job_id: JobId) -> bool {
        self.receipt(job_id).is_some()
    }

    fn record(&self, job_id: JobId, step: SettlementStep, state: Option<StepState>) {
        self.progress.entry(job_id).or_default().set(step, state);
    }

    /// All records, ordered by job id.
    pub fn snapshot(&self) -> Vec<SettlementRecord> {
        let mut records: Vec<SettlementRecord> = self
            .progress
            .iter()
            .map(|entry| SettlementRecord {
                job_id: *entry.key(),
                progress: entry.value().clone(),
            })
            .collect();
        records.sort_by_key(|r| r.job_id);
        records
    }

    pub fn len(&self) -> usize {
        self.progress.len()
    }

    pub fn is_empty(&self) -> bool {
        self.progress.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// All steps ran (or resumed) in this call.
    Settled(TransferReceipt),
    /// The job was already settled; no ledger calls were made.
    AlreadySettled(TransferReceipt),
}

impl SettlementOutcome {
    pub fn receipt(&self) -> TransferReceipt {
        match self {
            SettlementOutcome::Settled(r) | SettlementOutcome::AlreadySettled(r) => *r,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("custodial wallet: {0}")]
    Wallet(#[from] WalletError),

    #[error("{step} failed for job {job_id}: {source}")]
    Step {
        job_id: JobId,
        step: SettlementStep,
        #[source]
        source: LedgerError,
    },
}

pub struct TokenSettlement {
    ledger: Arc<dyn Ledger>,
    wallets: Arc<WalletCache>,
    records: Arc<SettlementLedger>,
    funder: Arc<WalletHandle>,
    terms: SettlementTerms,
}

impl TokenSettlement {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        wallets: Arc<WalletCache>,
        records: Arc<SettlementLedger>,
        funder: Arc<WalletHandle>,
        terms: SettlementTerms,
    ) -> Self {
        Self {
            ledger,
            wallets,
            records,
            funder,
            terms,
        }
    }

    pub fn records(&self) -> &Arc<SettlementLedger> {
        &self.records
    }

    pub fn funder_address(&self) -> Address {
        self.funder.address()
    }

    pub async fn settle(
        &self,
        job_id: JobId,
        custodial_secret_key: &str,
    ) -> Result<SettlementOutcome, SettlementError> {
        let lock = self.records.job_lock(job_id);
        let guard = lock.lock().await;
        let result = self.settle_locked(job_id, custodial_secret_key).await;
        drop(guard);
        self.records.release_job_lock(job_id, lock);
        result
    }

    async fn settle_locked(
        &self,
        job_id: JobId,
        custodial_secret_key: &str,
    ) -> Result<SettlementOutcome, SettlementError> {
        if let Some(receipt) = self.records.receipt(job_id) {
            tracing::info!(%job_id, "job already settled, skipping token transfer");
            return Ok(SettlementOutcome::AlreadySettled(receipt));
        }

        let custodial = self.wallets.get_or_create(custodial_secret_key)?;

        if self.records.progress(job_id).is_some_and(|p| p.is_started()) {
            tracing::info!(%job_id, "resuming partial settlement");
        } else {
            tracing::info!(%job_id, custodial = %custodial.address(), "starting settlement");
        }

        let funder_to_wallet = self
            .run_step(job_id, SettlementStep::DripToken, &custodial)
            .await?;
        self.run_step(job_id, SettlementStep::DripGas, &custodial)
            .await?;
        let wallet_to_client = self
            .run_step(job_id, SettlementStep::PayClient, &custodial)
            .await?;

        let receipt = TransferReceipt {
            funder_to_wallet_tx_hash: funder_to_wallet,
            wallet_to_client_tx_hash: wallet_to_client,
        };
        tracing::info!(
            %job_id,
            funder_to_wallet = %receipt.funder_to_wallet_tx_hash,
            wallet_to_client = %receipt.wallet_to_client_tx_hash,
            "settlement complete"
        );
        Ok(SettlementOutcome::Settled(receipt))
    }

    /// Drives one step to confirmation. A step already broadcast is waited on
    /// again rather than re-sent; a reverted step is cleared so the next
    /// attempt broadcasts it afresh.
    async fn run_step(
        &self,
        job_id: JobId,
        step: SettlementStep,
        custodial: &WalletHandle,
    ) -> Result<TxHash, SettlementError> {
        let known = self.records.progress(job_id).and_then(|p| p.step(step));

        let tx = match known {
            Some(StepState::Confirmed(tx)) => return Ok(tx),
            Some(StepState::Broadcast(tx)) => {
                tracing::info!(%job_id, %step, tx_hash = %tx, "awaiting earlier broadcast");
                tx
            }
            None => {
                let tx = self
                    .broadcast(step, custodial)
                    .await
                    .map_err(|source| SettlementError::Step {
                        job_id,
                        step,
                        source,
                    })?;
                self.records
                    .record(job_id, step, Some(StepState::Broadcast(tx)));
                tracing::info!(%job_id, %step, tx_hash = %tx, "broadcast");
                tx
            }
        };

        match self.ledger.wait_for_receipt(tx).await {
            Ok(()) => {
                self.records
                    .record(job_id, step, Some(StepState::Confirmed(tx)));
                tracing::info!(%job_id, %step, tx_hash = %tx, "confirmed");
                Ok(tx)
            }
            Err(source) => {
                if matches!(source, LedgerError::Reverted(_)) {
                    self.records.record(job_id, step, None);
                }
                Err(SettlementError::Step {
                    job_id,
                    step,
                    source,
                })
            }
        }
    }

    async fn broadcast(
        &self,
        step: SettlementStep,
        custodial: &WalletHandle,
    ) -> Result<TxHash, LedgerError> {
        match step {
            SettlementStep::DripToken => {
                self.ledger
                    .transfer_token(&self.funder, custodial.address(), self.terms.token_drip)
                    .await
            }
            SettlementStep::DripGas => {
                self.ledger
                    .transfer_native(&self.funder, custodial.address(), self.terms.gas_drip)
                    .await
            }
            SettlementStep::PayClient => {
                self.ledger
                    .transfer_token(custodial, self.terms.client_address, self.terms.client_cost)
                    .await
            }
        }
    }
}
