use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::utils::parse_ether;
use alloy::primitives::{Address, U256};
use contract_client::wallet::DEFAULT_WALLET_TTL;
use contract_client::ChainConfig;

use crate::settlement::SettlementTerms;
use crate::ConsumerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var: {0}")]
    Missing(&'static str),

    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Everything the worker reads at startup. Not `Debug`: it holds the funder key.
#[derive(Clone)]
pub struct WorkerConfig {
    pub supabase_url: String,
    pub supabase_key: String,
    pub queue_name: String,
    pub api_url: String,
    pub funder_private_key: String,
    pub chain: ChainConfig,
    pub terms: SettlementTerms,
    pub consumer: ConsumerConfig,
    pub wallet_ttl: Duration,
    pub http_timeout: Duration,
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv_layers();

        let chain_defaults = ChainConfig::default();
        let term_defaults = SettlementTerms::default();
        let consumer_defaults = ConsumerConfig::default();

        Ok(Self {
            supabase_url: read_var("SUPABASE_URL")?,
            supabase_key: read_var("SUPABASE_SERVICE_ROLE_KEY")?,
            queue_name: read_var("QUEUE_NAME")?,
            api_url: read_var("API_URL")?,
            funder_private_key: read_var("FUNDER_PRIVATE_KEY")?,
            chain: ChainConfig {
                rpc_url: read_optional_string("RPC_URL", &chain_defaults.rpc_url),
                chain_id: read_optional("CHAIN_ID", chain_defaults.chain_id)?,
                token_address: read_optional("TOKEN_ADDRESS", chain_defaults.token_address)?,
                receipt_timeout: read_optional_secs(
                    "RECEIPT_TIMEOUT_SECS",
                    chain_defaults.receipt_timeout,
                )?,
            },
            terms: SettlementTerms {
                client_address: read_optional::<Address>(
                    "CLIENT_ADDRESS",
                    term_defaults.client_address,
                )?,
                token_drip: read_optional_ether("TOKEN_DRIP", term_defaults.token_drip)?,
                gas_drip: read_optional_ether("GAS_DRIP", term_defaults.gas_drip)?,
                client_cost: read_optional_ether("CLIENT_COST", term_defaults.client_cost)?,
            },
            consumer: ConsumerConfig {
                visibility_timeout: read_optional_secs(
                    "VISIBILITY_TIMEOUT_SECS",
                    consumer_defaults.visibility_timeout,
                )?,
                batch_size: read_optional("BATCH_SIZE", consumer_defaults.batch_size)?.max(1),
                idle_backoff: read_optional_secs(
                    "IDLE_BACKOFF_SECS",
                    consumer_defaults.idle_backoff,
                )?,
                max_concurrency: read_optional(
                    "MAX_CONCURRENCY",
                    consumer_defaults.max_concurrency,
                )?
                .max(1),
            },
            wallet_ttl: read_optional_secs("WALLET_TTL_SECS", DEFAULT_WALLET_TTL)?,
            http_timeout: read_optional_secs("HTTP_TIMEOUT_SECS", Duration::from_secs(30))?,
            snapshot_path: optional_var("SETTLEMENT_SNAPSHOT_PATH").map(PathBuf::from),
            snapshot_interval: read_optional_secs(
                "SNAPSHOT_INTERVAL_SECS",
                Duration::from_secs(10),
            )?
            .max(Duration::from_secs(1)),
        })
    }
}

fn read_var(key: &'static str) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(key))
}

/// Set and non-blank; a blank optional var means "use the default".
fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn read_optional_string(key: &str, default: &str) -> String {
    optional_var(key).unwrap_or_else(|| default.to_string())
}

fn read_optional<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_var(key) {
        Some(v) => v.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn read_optional_secs(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    read_optional(key, default.as_secs()).map(Duration::from_secs)
}

fn read_optional_ether(key: &'static str, default: U256) -> Result<U256, ConfigError> {
    match optional_var(key) {
        Some(v) => parse_ether(v.trim()).map_err(|e| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn load_dotenv_layers() {
    for path in [".env", "../.env", "../../.env"] {
        let _ = dotenvy::from_path(path);
    }
}
