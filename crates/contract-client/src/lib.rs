pub mod wallet;

use std::time::Duration;

use alloy::network::{EthereumWallet, ReceiptResponse, TransactionBuilder};
use alloy::primitives::{address, Address, TxHash, U256};
use alloy::providers::{
    PendingTransactionBuilder, PendingTransactionError, Provider, ProviderBuilder, WatchTxError,
};
use alloy::rpc::types::TransactionRequest;
use alloy::sol;
use alloy::transports::http::reqwest::Url;
use async_trait::async_trait;

pub use wallet::{NonceGuard, WalletCache, WalletError, WalletHandle};

sol! {
    #[sol(rpc)]
    contract Erc20 {
        function transfer(address to, uint256 amount) external returns (bool);
        function balanceOf(address owner) external view returns (uint256);
    }
}

pub const TORUS_CHAIN_ID: u64 = 8192;
pub const TORUS_RPC_URL: &str = "https://rpc.toruschain.com/";
pub const UNREAL_TOKEN_ADDRESS: Address = address!("A409B5E5D34928a0F1165c7a73c8aC572D1aBCDB");

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("broadcast failed: {0}")]
    Broadcast(String),

    #[error("timed out waiting for receipt of {0}")]
    ReceiptTimeout(TxHash),

    #[error("transaction {0} reverted")]
    Reverted(TxHash),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

/// The on-chain operations a settlement needs. Broadcast calls return as soon
/// as the node accepts the transaction; confirmation is a separate wait.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// ERC-20 `transfer` on the configured token contract, signed by `from`.
    async fn transfer_token(
        &self,
        from: &WalletHandle,
        to: Address,
        amount: U256,
    ) -> Result<TxHash, LedgerError>;

    /// Plain native-currency value transfer signed by `from`.
    async fn transfer_native(
        &self,
        from: &WalletHandle,
        to: Address,
        amount: U256,
    ) -> Result<TxHash, LedgerError>;

    /// Blocks until `tx` is mined. A mined-but-failed transaction is
    /// `LedgerError::Reverted`.
    async fn wait_for_receipt(&self, tx: TxHash) -> Result<(), LedgerError>;
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub token_address: Address,
    pub receipt_timeout: Duration,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: TORUS_RPC_URL.to_string(),
            chain_id: TORUS_CHAIN_ID,
            token_address: UNREAL_TOKEN_ADDRESS,
            receipt_timeout: Duration::from_secs(120),
        }
    }
}

pub struct AlloyLedger {
    rpc_url: Url,
    token_address: Address,
    receipt_timeout: Duration,
}

impl AlloyLedger {
    pub fn new(config: &ChainConfig) -> Result<Self, LedgerError> {
        let rpc_url: Url = config
            .rpc_url
            .parse()
            .map_err(|e| LedgerError::InvalidConfig(format!("invalid rpc url: {e}")))?;
        Ok(Self {
            rpc_url,
            token_address: config.token_address,
            receipt_timeout: config.receipt_timeout,
        })
    }

    pub fn token_address(&self) -> Address {
        self.token_address
    }

    pub async fn token_balance(&self, owner: Address) -> Result<U256, LedgerError> {
        let provider = ProviderBuilder::new().connect_http(self.rpc_url.clone());
        let token = Erc20::new(self.token_address, provider);
        token
            .balanceOf(owner)
            .call()
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))
    }
}

#[async_trait]
impl Ledger for AlloyLedger {
    async fn transfer_token(
        &self,
        from: &WalletHandle,
        to: Address,
        amount: U256,
    ) -> Result<TxHash, LedgerError> {
        let wallet = EthereumWallet::from(from.signer().clone());
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(self.rpc_url.clone());

        let mut nonce = from.lock_nonce().await;
        let next = pending_nonce(&provider, &nonce, from.address()).await?;

        let token = Erc20::new(self.token_address, provider);
        let sent = token
            .transfer(to, amount)
            .nonce(next)
            .send()
            .await
            .map(|pending_tx| *pending_tx.tx_hash())
            .map_err(|e| e.to_string());

        track_nonce(&mut nonce, next, sent)
    }

    async fn transfer_native(
        &self,
        from: &WalletHandle,
        to: Address,
        amount: U256,
    ) -> Result<TxHash, LedgerError> {
        let wallet = EthereumWallet::from(from.signer().clone());
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(self.rpc_url.clone());

        let mut nonce = from.lock_nonce().await;
        let next = pending_nonce(&provider, &nonce, from.address()).await?;

        let tx = TransactionRequest::default()
            .with_from(from.address())
            .with_to(to)
            .with_value(amount)
            .with_nonce(next);

        let sent = provider
            .send_transaction(tx)
            .await
            .map(|pending_tx| *pending_tx.tx_hash())
            .map_err(|e| e.to_string());

        track_nonce(&mut nonce, next, sent)
    }

    async fn wait_for_receipt(&self, tx: TxHash) -> Result<(), LedgerError> {
        let provider = ProviderBuilder::new().connect_http(self.rpc_url.clone());

        let receipt = PendingTransactionBuilder::new(provider.root().clone(), tx)
            .with_timeout(Some(self.receipt_timeout))
            .get_receipt()
            .await
            .map_err(|e| match e {
                PendingTransactionError::TxWatcher(WatchTxError::Timeout) => {
                    LedgerError::ReceiptTimeout(tx)
                }
                other => LedgerError::Rpc(other.to_string()),
            })?;

        if !receipt.status() {
            return Err(LedgerError::Reverted(tx));
        }

        tracing::debug!(
            tx_hash = %tx,
            block = ?receipt.block_number(),
            "receipt confirmed"
        );
        Ok(())
    }
}

/// The nonce for the next broadcast from `from`: the tracked value, or the
/// node's pending count when nothing is tracked yet.
async fn pending_nonce<P: Provider>(
    provider: &P,
    guard: &NonceGuard<'_>,
    from: Address,
) -> Result<u64, LedgerError> {
    if let Some(next) = guard.cached() {
        return Ok(next);
    }
    provider
        .get_transaction_count(from)
        .pending()
        .await
        .map_err(|e| LedgerError::Rpc(format!("nonce lookup for {from}: {e}")))
}

/// A rejected broadcast drops the tracked nonce; the next send resyncs from
/// the node.
fn track_nonce(
    guard: &mut NonceGuard<'_>,
    used: u64,
    sent: Result<TxHash, String>,
) -> Result<TxHash, LedgerError> {
    match sent {
        Ok(tx) => {
            guard.consumed(used);
            Ok(tx)
        }
        Err(e) => {
            guard.invalidate();
            Err(LedgerError::Broadcast(e))
        }
    }
}
