//! Minimal PostgREST client for the Supabase project that hosts the queue and
//! the profile table.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};

pub fn http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder().timeout(timeout).build()
}

#[derive(Clone)]
pub struct SupabaseRest {
    base_url: String,
    api_key: String,
    http: Client,
}

impl SupabaseRest {
    pub fn new(base_url: &str, api_key: &str, http: Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http,
        }
    }

    /// `POST /rest/v1/rpc/{function}`
    pub(crate) fn rpc(&self, function: &str) -> RequestBuilder {
        let url = format!("{}/rest/v1/rpc/{}", self.base_url, function);
        self.authorize(self.http.post(url))
    }

    /// `GET /rest/v1/{table}`
    pub(crate) fn select(&self, table: &str) -> RequestBuilder {
        let url = format!("{}/rest/v1/{}", self.base_url, table);
        self.authorize(self.http.get(url))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }
}

/// Splits a response into its success body or the status and error text.
pub(crate) async fn into_success(response: Response) -> Result<Response, (StatusCode, String)> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err((status, body))
}
