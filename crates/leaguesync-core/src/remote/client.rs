//! HTTP client for a PostgREST-style backend.
//!
//! Each table is exposed at `{base_url}/rest/v1/{table}`. Rows are addressed
//! with `?id=eq.{id}` filters, and `Prefer: return=representation` makes
//! mutations echo the stored row back.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response};
use serde_json::Value;
use tracing::{debug, warn};

use super::{ListQuery, RemoteError, RemoteStore};
use crate::models::Table;

// ============================================================================
// Constants
// ============================================================================

const REST_PATH: &str = "rest/v1";

/// HTTP request timeout in seconds.
/// The sync layer has no timeout of its own; this bounds every remote call.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

const PREFER_RETURN: &str = "return=representation";
const PREFER_UPSERT: &str = "resolution=merge-duplicates,return=representation";

/// Remote store client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct RestRemoteStore {
    client: Client,
    base_url: String,
    api_key: String,
    token: Option<String>,
}

impl RestRemoteStore {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            token: None,
        })
    }

    /// Set the bearer token of the signed-in user. Without one, the API key is
    /// used as the bearer.
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    fn table_url(&self, table: Table) -> String {
        format!("{}/{}/{}", self.base_url, REST_PATH, table)
    }

    fn headers(&self, prefer: &str) -> Result<header::HeaderMap, RemoteError> {
        let bearer = self.token.as_deref().unwrap_or(&self.api_key);
        let value = |v: &str| {
            header::HeaderValue::from_str(v)
                .map_err(|e| RemoteError::InvalidRequest(format!("bad header value: {}", e)))
        };

        let mut headers = header::HeaderMap::new();
        headers.insert("apikey", value(&self.api_key)?);
        headers.insert(header::AUTHORIZATION, value(&format!("Bearer {}", bearer))?);
        headers.insert(header::ACCEPT, value("application/json")?);
        headers.insert("prefer", value(prefer)?);
        Ok(headers)
    }

    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>, RemoteError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::from_status(status, &body))
        }
    }

    /// Send the request built by `build`, backing off on 429.
    async fn send(
        &self,
        what: &str,
        prefer: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response, RemoteError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build().headers(self.headers(prefer)?).send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(RemoteError::RateLimited);
                    }
                    warn!(request = what, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }

    async fn rows(response: Response) -> Result<Vec<Value>, RemoteError> {
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(&body)
            .map_err(|e| RemoteError::InvalidResponse(format!("not JSON: {}", e)))?
        {
            Value::Array(rows) => Ok(rows),
            row @ Value::Object(_) => Ok(vec![row]),
            other => Err(RemoteError::InvalidResponse(format!("unexpected body: {}", other))),
        }
    }

    async fn first_row(response: Response) -> Result<Value, RemoteError> {
        Self::rows(response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::InvalidResponse("no row returned".to_string()))
    }
}

#[async_trait]
impl RemoteStore for RestRemoteStore {
    async fn insert(&self, table: Table, payload: &Value) -> Result<Value, RemoteError> {
        let url = self.table_url(table);
        debug!(table = %table, "POST insert");
        let response = self
            .send("insert", PREFER_RETURN, || self.client.post(&url).json(payload))
            .await?;
        Self::first_row(response).await
    }

    async fn update(&self, table: Table, id: &str, payload: &Value) -> Result<Value, RemoteError> {
        let url = self.table_url(table);
        let filter = [("id", format!("eq.{}", id))];
        debug!(table = %table, id = id, "PATCH update");
        let response = self
            .send("update", PREFER_RETURN, || self.client.patch(&url).query(&filter).json(payload))
            .await?;
        Self::rows(response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::NotFound(format!("{} {}", table, id)))
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError> {
        let url = self.table_url(table);
        let filter = [("id", format!("eq.{}", id))];
        debug!(table = %table, id = id, "DELETE");
        self.send("delete", PREFER_RETURN, || self.client.delete(&url).query(&filter))
            .await?;
        Ok(())
    }

    async fn upsert(&self, table: Table, payload: &Value) -> Result<Value, RemoteError> {
        let url = self.table_url(table);
        debug!(table = %table, "POST upsert");
        let response = self
            .send("upsert", PREFER_UPSERT, || self.client.post(&url).json(payload))
            .await?;
        Self::first_row(response).await
    }

    async fn fetch_by_id(&self, table: Table, id: &str) -> Result<Option<Value>, RemoteError> {
        let url = self.table_url(table);
        let filter = [("id", format!("eq.{}", id)), ("limit", "1".to_string())];
        let response = self
            .send("fetch_by_id", PREFER_RETURN, || self.client.get(&url).query(&filter))
            .await?;
        Ok(Self::rows(response).await?.into_iter().next())
    }

    async fn fetch_list(&self, table: Table, query: &ListQuery) -> Result<Vec<Value>, RemoteError> {
        let url = self.table_url(table);
        let pairs = query.to_query_pairs();
        let response = self
            .send("fetch_list", PREFER_RETURN, || self.client.get(&url).query(&pairs))
            .await?;
        Self::rows(response).await
    }
}
