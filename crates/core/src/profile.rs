use serde::{Deserialize, Serialize};

/// Snapshot of a user's profile row, fetched per job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub credit_balance: f64,
    #[serde(default)]
    pub wallet: Option<CustodialWallet>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CustodialWallet {
    #[serde(default)]
    pub address: String,
    #[serde(
        default,
        rename = "privateKey",
        alias = "secretKey",
        skip_serializing_if = "Option::is_none"
    )]
    pub secret_key: Option<String>,
}

impl Profile {
    /// Key material for the custodial wallet, if the profile carries one.
    pub fn custodial_secret_key(&self) -> Option<&str> {
        self.wallet
            .as_ref()
            .and_then(|w| w.secret_key.as_deref())
            .filter(|k| !k.is_empty())
    }
}

// Keeps secret keys out of logs.
impl std::fmt::Debug for CustodialWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustodialWallet")
            .field("address", &self.address)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
