/// REST surface used for hydration: conversation list, history, profiles
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Read-only REST calls the session needs. Responses are returned raw; shape
/// tolerance lives in the normalizer.
#[async_trait]
pub trait MessagingApi: Send + Sync + 'static {
    /// `GET /api/conversations`
    async fn fetch_conversations(&self) -> Result<Value>;

    /// `GET /api/conversations/{id}`
    async fn fetch_history(&self, conversation_id: &str) -> Result<Value>;

    /// `GET /api/profile/{id}`
    async fn fetch_profile(&self, user_id: &str) -> Result<Value>;
}

/// `MessagingApi` over HTTP with a bearer token.
///
/// The token is read per request from a shared `watch`, so a rotation
/// published by the capability gate applies to the next call.
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    token: watch::Receiver<Option<String>>,
}

impl HttpApi {
    pub fn new(base_url: &str, token: watch::Receiver<Option<String>>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn bearer(&self) -> Result<String> {
        self.token
            .borrow()
            .clone()
            .ok_or_else(|| SyncError::Config("No session token for REST request".to_string()))
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = self.url(path);
        let token = self.bearer()?;
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Http(format!("GET {} returned {}", path, status)));
        }
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl MessagingApi for HttpApi {
    async fn fetch_conversations(&self) -> Result<Value> {
        self.get_json("/api/conversations").await
    }

    async fn fetch_history(&self, conversation_id: &str) -> Result<Value> {
        self.get_json(&format!("/api/conversations/{}", urlencoding::encode(conversation_id)))
            .await
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<Value> {
        self.get_json(&format!("/api/profile/{}", urlencoding::encode(user_id)))
            .await
    }
}
