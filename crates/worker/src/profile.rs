use async_trait::async_trait;
use dart_core::profile::Profile;
use reqwest::StatusCode;

use crate::supabase::{into_success, SupabaseRest};

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("profile request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("profile lookup returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("no profile for user {0}")]
    NotFound(String),
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn profile(&self, user_id: &str) -> Result<Profile, ProfileError>;
}

pub struct SupabaseProfiles {
    rest: SupabaseRest,
}

impl SupabaseProfiles {
    pub fn new(rest: SupabaseRest) -> Self {
        Self { rest }
    }
}

#[async_trait]
impl ProfileStore for SupabaseProfiles {
    async fn profile(&self, user_id: &str) -> Result<Profile, ProfileError> {
        let response = self
            .rest
            .select("profiles")
            .query(&[
                ("id", format!("eq.{user_id}")),
                ("select", "credit_balance,wallet".to_string()),
            ])
            // Single-object response; PostgREST answers 406 when no row matches.
            .header("Accept", "application/vnd.pgrst.object+json")
            .send()
            .await?;

        let response = match into_success(response).await {
            Ok(r) => r,
            Err((StatusCode::NOT_ACCEPTABLE, _)) => {
                return Err(ProfileError::NotFound(user_id.to_string()))
            }
            Err((status, body)) => {
                return Err(ProfileError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        };

        Ok(response.json().await?)
    }
}
