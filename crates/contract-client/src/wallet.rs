//! Signing wallets for custodial accounts.
//!
//! A [`WalletHandle`] is a pure function of its secret key and the chain id, so
//! the cache hands the same `Arc` to every caller for one key until the entry
//! expires. Expired entries are rebuilt on the next lookup.
//!
//! The handle also owns the account's nonce slot. Every broadcast from the
//! account goes through [`WalletHandle::lock_nonce`], so concurrent jobs that
//! share a sender (the funder, or one custodial wallet) never sign the same
//! nonce twice.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

pub const DEFAULT_WALLET_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("invalid private key format: expected 0x followed by 64 hex characters")]
    InvalidKeyFormat,

    #[error("invalid private key: {0}")]
    InvalidKey(String),
}

pub struct WalletHandle {
    signer: PrivateKeySigner,
    address: Address,
    next_nonce: Mutex<Option<u64>>,
}

impl WalletHandle {
    pub fn from_secret_key(secret_key: &str, chain_id: u64) -> Result<Self, WalletError> {
        validate_key_format(secret_key)?;
        let signer = PrivateKeySigner::from_str(secret_key)
            .map_err(|e| WalletError::InvalidKey(e.to_string()))?
            .with_chain_id(Some(chain_id));
        let address = signer.address();
        Ok(Self {
            signer,
            address,
            next_nonce: Mutex::new(None),
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn signer(&self) -> &PrivateKeySigner {
        &self.signer
    }

    /// Exclusive access to the account's nonce for the duration of one
    /// broadcast. Other senders on this handle wait until the guard drops.
    pub async fn lock_nonce(&self) -> NonceGuard<'_> {
        NonceGuard(self.next_nonce.lock().await)
    }
}

/// Held while a transaction from one account is signed and sent.
pub struct NonceGuard<'a>(MutexGuard<'a, Option<u64>>);

impl NonceGuard<'_> {
    /// The locally tracked next nonce. `None` before the first broadcast and
    /// after a failed one; the caller then reads the pending count from the node.
    pub fn cached(&self) -> Option<u64> {
        *self.0
    }

    /// `used` was accepted by the node.
    pub fn consumed(&mut self, used: u64) {
        *self.0 = Some(used + 1);
    }

    /// Forget the tracked value so the next broadcast resyncs with the node.
    pub fn invalidate(&mut self) {
        *self.0 = None;
    }
}

impl std::fmt::Debug for WalletHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletHandle")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// `0x` followed by exactly 64 hex digits.
pub fn validate_key_format(secret_key: &str) -> Result<(), WalletError> {
    let digits = secret_key
        .strip_prefix("0x")
        .ok_or(WalletError::InvalidKeyFormat)?;
    if digits.len() != 64 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(WalletError::InvalidKeyFormat);
    }
    Ok(())
}

struct CacheEntry {
    handle: Arc<WalletHandle>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

pub struct WalletCache {
    chain_id: u64,
    ttl: Duration,
    entries: DashMap<String, CacheEntry>,
    constructed: AtomicU64,
}

impl WalletCache {
    pub fn new(chain_id: u64, ttl: Duration) -> Self {
        Self {
            chain_id,
            ttl,
            entries: DashMap::new(),
            constructed: AtomicU64::new(0),
        }
    }

    /// Returns the live handle for `secret_key`, building one on a miss.
    ///
    /// The entry lock is held while building, so concurrent callers for the
    /// same key observe a single construction.
    pub fn get_or_create(&self, secret_key: &str) -> Result<Arc<WalletHandle>, WalletError> {
        let now = Instant::now();

        if let Some(entry) = self.entries.get(secret_key) {
            if entry.is_live(now) {
                return Ok(entry.handle.clone());
            }
        }

        validate_key_format(secret_key)?;
        self.purge_expired();

        let handle = match self.entries.entry(secret_key.to_owned()) {
            Entry::Occupied(entry) if entry.get().is_live(now) => entry.get().handle.clone(),
            entry => {
                let handle = Arc::new(WalletHandle::from_secret_key(secret_key, self.chain_id)?);
                self.constructed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(address = %handle.address(), "materialized custodial wallet");
                entry.insert(CacheEntry {
                    handle: handle.clone(),
                    expires_at: now + self.ttl,
                });
                handle
            }
        };

        Ok(handle)
    }

    /// Drops every entry whose validity window has closed.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.is_live(now));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of handles built over the cache's lifetime.
    pub fn constructions(&self) -> u64 {
        self.constructed.load(Ordering::Relaxed)
    }
}
