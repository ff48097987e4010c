//! HTTP backend speaking the PostgREST dialect
//!
//! - create: `POST {base}/{table}`
//! - update: `PATCH {base}/{table}?id=eq.{id}`
//! - delete: `DELETE {base}/{table}?id=eq.{id}`
//!
//! Every request asks for `return=representation` so that an update or delete
//! that matched no row can be told apart from a successful one.

use super::{RemoteBackend, RemoteRecord};
use crate::error::{SyncError, SyncFailure, SyncResult};
use crate::record::{EntityKind, Payload};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Connection settings for [`RestBackend`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    /// Base URL of the REST endpoint, e.g. `https://db.example.com/rest/v1`
    pub base_url: String,
    /// Sent as the `apikey` header when present
    pub api_key: Option<String>,
    /// Sent as a bearer token when present
    pub auth_token: Option<String>,
    /// Transport-level timeout
    #[serde(with = "crate::config::duration_millis")]
    pub timeout: Duration,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            api_key: None,
            auth_token: None,
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct RestBackend {
    config: RestConfig,
    client: reqwest::Client,
}

impl RestBackend {
    pub fn new(config: RestConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SyncError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    pub fn table_url(&self, kind: EntityKind) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), kind.table())
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        let mut builder = builder.header("Prefer", "return=representation");
        if let Some(key) = &self.config.api_key {
            builder = builder.header("apikey", key);
        }
        if let Some(token) = &self.config.auth_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Vec<Value>, SyncFailure> {
        let response = self
            .request(builder)
            .send()
            .await
            .map_err(|e| self.transport_failure(e))?;
        let response = check_status(response).await?;

        match response.json::<Value>().await {
            Ok(Value::Array(rows)) => Ok(rows),
            Ok(Value::Object(row)) => Ok(vec![Value::Object(row)]),
            Ok(Value::Null) => Ok(Vec::new()),
            Ok(other) => Err(SyncFailure::Decode(format!("unexpected response body: {other}"))),
            Err(e) => Err(SyncFailure::Decode(e.to_string())),
        }
    }

    fn transport_failure(&self, err: reqwest::Error) -> SyncFailure {
        if err.is_timeout() {
            SyncFailure::Timeout(self.config.timeout)
        } else {
            SyncFailure::Network(err.to_string())
        }
    }
}

async fn check_status(response: Response) -> Result<Response, SyncFailure> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(SyncFailure::NotFound);
    }
    let message = response.text().await.unwrap_or_default();
    Err(SyncFailure::Rejected {
        status: status.as_u16(),
        message,
    })
}

fn id_filter(id: &str) -> [(&'static str, String); 1] {
    [("id", format!("eq.{id}"))]
}

#[async_trait]
impl RemoteBackend for RestBackend {
    async fn create(&self, kind: EntityKind, payload: Payload) -> Result<RemoteRecord, SyncFailure> {
        let rows = self
            .send(self.client.post(self.table_url(kind)).json(&payload))
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| SyncFailure::Decode("create returned no row".to_string()))?;

        RemoteRecord::from_row(row)
    }

    async fn update(&self, kind: EntityKind, id: &str, payload: Payload) -> Result<(), SyncFailure> {
        let rows = self
            .send(
                self.client
                    .patch(self.table_url(kind))
                    .query(&id_filter(id))
                    .json(&payload),
            )
            .await?;
        if rows.is_empty() {
            return Err(SyncFailure::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), SyncFailure> {
        let rows = self
            .send(self.client.delete(self.table_url(kind)).query(&id_filter(id)))
            .await?;
        if rows.is_empty() {
            return Err(SyncFailure::NotFound);
        }
        Ok(())
    }
}
