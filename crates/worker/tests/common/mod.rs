#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, TxHash, B256, U256};
use async_trait::async_trait;
use contract_client::wallet::DEFAULT_WALLET_TTL;
use contract_client::{Ledger, LedgerError, WalletCache, WalletHandle};
use dart_core::ids::JobId;
use dart_core::job::{Job, JobInputs, JobMessage};
use dart_core::profile::{CustodialWallet, Profile};
use serde_json::Map;
use tokio::time::Instant;
use worker::dispatch::{DispatchError, Downstream};
use worker::handler::Pipeline;
use worker::profile::{ProfileError, ProfileStore};
use worker::queue::{JobQueue, QueueError};
use worker::settlement::{SettlementLedger, SettlementTerms, TokenSettlement};
use worker::{ConsumerConfig, Worker};

pub const CHAIN_ID: u64 = 8192;
pub const FUNDER_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

pub fn custodial_key(byte: u8) -> String {
    format!("0x{}", hex_byte(byte).repeat(32))
}

fn hex_byte(byte: u8) -> String {
    format!("{byte:02x}")
}

pub fn custodial_address(byte: u8) -> Address {
    WalletHandle::from_secret_key(&custodial_key(byte), CHAIN_ID)
        .unwrap()
        .address()
}

pub fn make_job(id: i64, author: &str) -> Job {
    Job {
        msg_id: JobId(id),
        message: JobMessage {
            module: "image-gen".to_string(),
            version: "1.0.0".to_string(),
            author: author.to_string(),
            inputs: JobInputs {
                cpu: Some(1.0),
                ram: Some(512.0),
            },
            token_transactions: None,
            extra: Map::new(),
        },
        read_ct: None,
    }
}

pub fn wallet_profile(byte: u8) -> Profile {
    Profile {
        credit_balance: 10.0,
        wallet: Some(CustodialWallet {
            address: custodial_address(byte).to_string(),
            secret_key: Some(custodial_key(byte)),
        }),
    }
}

pub fn walletless_profile() -> Profile {
    Profile {
        credit_balance: 10.0,
        wallet: None,
    }
}

/// Shared, ordered record of every side-effecting call across the fakes.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn since(&self, start: usize) -> Vec<String> {
        self.0.lock().unwrap()[start..].to_vec()
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct QueuedMessage {
    job: Job,
    visible_at: Instant,
    read_ct: i32,
}

/// In-memory queue with visibility-timeout redelivery.
pub struct FakeQueue {
    log: CallLog,
    messages: Mutex<Vec<QueuedMessage>>,
    failing_reads: AtomicUsize,
    failing_deletes: AtomicUsize,
    pub reads: AtomicUsize,
}

impl FakeQueue {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            messages: Mutex::new(Vec::new()),
            failing_reads: AtomicUsize::new(0),
            failing_deletes: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, job: Job) {
        self.messages.lock().unwrap().push(QueuedMessage {
            job,
            visible_at: Instant::now(),
            read_ct: 0,
        });
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.job.msg_id == id)
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_deletes(&self, n: usize) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl JobQueue for FakeQueue {
    async fn read(
        &self,
        visibility_timeout: Duration,
        max_count: usize,
    ) -> Result<Vec<Job>, QueueError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_reads) {
            return Err(QueueError::Status {
                status: 503,
                body: "queue unavailable".to_string(),
            });
        }

        let now = Instant::now();
        let mut messages = self.messages.lock().unwrap();
        let mut batch = Vec::new();
        for message in messages.iter_mut().filter(|m| m.visible_at <= now) {
            if batch.len() == max_count {
                break;
            }
            message.visible_at = now + visibility_timeout;
            message.read_ct += 1;
            let mut job = message.job.clone();
            job.read_ct = Some(message.read_ct);
            batch.push(job);
        }
        Ok(batch)
    }

    async fn delete(&self, id: JobId) -> Result<(), QueueError> {
        self.log.push(format!("delete:{id}"));
        if take_failure(&self.failing_deletes) {
            return Err(QueueError::Status {
                status: 500,
                body: "delete failed".to_string(),
            });
        }
        let mut messages = self.messages.lock().unwrap();
        let before = messages.len();
        messages.retain(|m| m.job.msg_id != id);
        if messages.len() == before {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeProfiles {
    profiles: Mutex<HashMap<String, Profile>>,
    pub lookups: AtomicUsize,
}

impl FakeProfiles {
    pub fn insert(&self, user_id: &str, profile: Profile) {
        self.profiles
            .lock()
            .unwrap()
            .insert(user_id.to_string(), profile);
    }
}

#[async_trait]
impl ProfileStore for FakeProfiles {
    async fn profile(&self, user_id: &str) -> Result<Profile, ProfileError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.profiles
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .ok_or_else(|| ProfileError::NotFound(user_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    /// The broadcast itself is rejected.
    Broadcast,
    /// Broadcast succeeds, the receipt wait times out.
    Timeout,
    /// Broadcast succeeds, the transaction reverts.
    Revert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentTx {
    pub hash: TxHash,
    pub label: &'static str,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub nonce: u64,
}

struct PlannedFailure {
    label: &'static str,
    mode: FailMode,
    remaining: usize,
}

/// Records calls as `drip-token` / `drip-gas` / `pay-client` / `wait`,
/// labelling token transfers by whether the funder signed them.
///
/// Nonces behave like a node's: each sender has a pending count, a broadcast
/// must carry exactly that nonce, and there is a yield between the nonce read
/// and the send so concurrent senders interleave.
pub struct FakeLedger {
    log: CallLog,
    funder: Address,
    next_hash: AtomicU64,
    pending_nonces: Mutex<HashMap<Address, u64>>,
    sent: Mutex<Vec<SentTx>>,
    failures: Mutex<Vec<PlannedFailure>>,
    wait_delay: Mutex<Duration>,
}

impl FakeLedger {
    pub fn new(log: CallLog, funder: Address) -> Self {
        Self {
            log,
            funder,
            next_hash: AtomicU64::new(1),
            pending_nonces: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            wait_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Fail the next `times` occurrences of step `label`.
    pub fn fail(&self, label: &'static str, mode: FailMode, times: usize) {
        self.failures.lock().unwrap().push(PlannedFailure {
            label,
            mode,
            remaining: times,
        });
    }

    pub fn set_wait_delay(&self, delay: Duration) {
        *self.wait_delay.lock().unwrap() = delay;
    }

    pub fn sent(&self) -> Vec<SentTx> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_by_hash(&self, hash: TxHash) -> Option<SentTx> {
        self.sent().into_iter().find(|tx| tx.hash == hash)
    }

    /// Nonces of every accepted transaction from `sender`, in send order.
    pub fn nonces_from(&self, sender: Address) -> Vec<u64> {
        self.sent()
            .into_iter()
            .filter(|tx| tx.from == sender)
            .map(|tx| tx.nonce)
            .collect()
    }

    fn pending_nonce(&self, sender: Address) -> u64 {
        self.pending_nonces
            .lock()
            .unwrap()
            .get(&sender)
            .copied()
            .unwrap_or(0)
    }

    fn take_failure(&self, label: &str, mode: FailMode) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures
            .iter_mut()
            .find(|f| f.label == label && f.mode == mode && f.remaining > 0)
        {
            Some(f) => {
                f.remaining -= 1;
                true
            }
            None => false,
        }
    }

    async fn send(
        &self,
        label: &'static str,
        from: &WalletHandle,
        to: Address,
        amount: U256,
    ) -> Result<TxHash, LedgerError> {
        self.log.push(label);
        let sender = from.address();

        let mut slot = from.lock_nonce().await;
        let nonce = slot.cached().unwrap_or_else(|| self.pending_nonce(sender));
        tokio::task::yield_now().await;

        if self.take_failure(label, FailMode::Broadcast) {
            slot.invalidate();
            return Err(LedgerError::Broadcast("insufficient funds".to_string()));
        }

        {
            let mut pending = self.pending_nonces.lock().unwrap();
            let expected = pending.entry(sender).or_insert(0);
            if nonce != *expected {
                slot.invalidate();
                return Err(LedgerError::Broadcast(format!(
                    "nonce too low: got {nonce}, next is {expected}"
                )));
            }
            *expected += 1;
        }
        slot.consumed(nonce);

        let n = self.next_hash.fetch_add(1, Ordering::SeqCst);
        let hash = B256::from(U256::from(n));
        self.sent.lock().unwrap().push(SentTx {
            hash,
            label,
            from: sender,
            to,
            amount,
            nonce,
        });
        Ok(hash)
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn transfer_token(
        &self,
        from: &WalletHandle,
        to: Address,
        amount: U256,
    ) -> Result<TxHash, LedgerError> {
        let label = if from.address() == self.funder {
            "drip-token"
        } else {
            "pay-client"
        };
        self.send(label, from, to, amount).await
    }

    async fn transfer_native(
        &self,
        from: &WalletHandle,
        to: Address,
        amount: U256,
    ) -> Result<TxHash, LedgerError> {
        self.send("drip-gas", from, to, amount).await
    }

    async fn wait_for_receipt(&self, tx: TxHash) -> Result<(), LedgerError> {
        self.log.push("wait");
        let delay = *self.wait_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let label = self
            .sent_by_hash(tx)
            .map(|s| s.label)
            .ok_or_else(|| LedgerError::Rpc(format!("unknown transaction {tx}")))?;
        if self.take_failure(label, FailMode::Timeout) {
            return Err(LedgerError::ReceiptTimeout(tx));
        }
        if self.take_failure(label, FailMode::Revert) {
            return Err(LedgerError::Reverted(tx));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Downstream
// ---------------------------------------------------------------------------

pub struct FakeDownstream {
    log: CallLog,
    status: AtomicU16,
    dispatched: Mutex<Vec<Job>>,
}

impl FakeDownstream {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            status: AtomicU16::new(200),
            dispatched: Mutex::new(Vec::new()),
        }
    }

    pub fn respond_with(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub fn dispatched(&self) -> Vec<Job> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl Downstream for FakeDownstream {
    async fn dispatch(&self, job: &Job) -> Result<(), DispatchError> {
        self.log.push("dispatch");
        self.dispatched.lock().unwrap().push(job.clone());
        let status = self.status.load(Ordering::SeqCst);
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(DispatchError::Status {
                status,
                body: "internal error".to_string(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub log: CallLog,
    pub queue: Arc<FakeQueue>,
    pub profiles: Arc<FakeProfiles>,
    pub ledger: Arc<FakeLedger>,
    pub downstream: Arc<FakeDownstream>,
    pub wallets: Arc<WalletCache>,
    pub records: Arc<SettlementLedger>,
    pub settlement: Arc<TokenSettlement>,
    pub worker: Arc<Worker>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_records(Arc::new(SettlementLedger::new()), ConsumerConfig::default())
    }

    pub fn with_consumer(config: ConsumerConfig) -> Self {
        Self::with_records(Arc::new(SettlementLedger::new()), config)
    }

    pub fn with_records(records: Arc<SettlementLedger>, config: ConsumerConfig) -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let log = CallLog::default();
        let funder = Arc::new(WalletHandle::from_secret_key(FUNDER_KEY, CHAIN_ID).unwrap());
        let queue = Arc::new(FakeQueue::new(log.clone()));
        let profiles = Arc::new(FakeProfiles::default());
        let ledger = Arc::new(FakeLedger::new(log.clone(), funder.address()));
        let downstream = Arc::new(FakeDownstream::new(log.clone()));
        let wallets = Arc::new(WalletCache::new(CHAIN_ID, DEFAULT_WALLET_TTL));

        let settlement = Arc::new(TokenSettlement::new(
            ledger.clone(),
            wallets.clone(),
            records.clone(),
            funder,
            SettlementTerms::default(),
        ));
        let pipeline = Pipeline::new(
            profiles.clone(),
            settlement.clone(),
            downstream.clone(),
            queue.clone(),
        );
        let worker = Worker::new(queue.clone(), pipeline, config);

        Self {
            log,
            queue,
            profiles,
            ledger,
            downstream,
            wallets,
            records,
            settlement,
            worker,
        }
    }
}

pub const SETTLEMENT_CALLS: [&str; 6] = [
    "drip-token",
    "wait",
    "drip-gas",
    "wait",
    "pay-client",
    "wait",
];
