use alloy_primitives::TxHash;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::JobId;

/// A row handed out by the queue. Extra row columns (`enqueued_at`, `vt`, ...)
/// are ignored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub msg_id: JobId,
    pub message: JobMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_ct: Option<i32>,
}

/// The payload forwarded downstream. Fields this worker does not know about
/// are carried through untouched in `extra`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub module: String,
    pub version: String,
    pub author: String,
    #[serde(default)]
    pub inputs: JobInputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_transactions: Option<TransferReceipt>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobInputs {
    pub cpu: Option<f64>,
    pub ram: Option<f64>,
}

/// Evidence that a job's settlement ran: the funder → custodial token drip
/// and the custodial → client payment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReceipt {
    pub funder_to_wallet_tx_hash: TxHash,
    pub wallet_to_client_tx_hash: TxHash,
}

impl Job {
    pub fn id(&self) -> JobId {
        self.msg_id
    }

    pub fn attach_receipt(&mut self, receipt: TransferReceipt) {
        self.message.token_transactions = Some(receipt);
    }
}
