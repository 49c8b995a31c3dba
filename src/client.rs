use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Response, Url};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::{
    chat::ChatMessage,
    http::server::{SendMessageResponse, SessionResponse},
    session::SessionRegistry,
};

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// HTTP client for a running relay, used by widgets and scripts.
#[derive(Clone, Debug)]
pub struct RelayClient {
    http: reqwest::Client,
    base: Url,
}

impl RelayClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("Invalid relay URL: {base_url}"))?;
        if base.cannot_be_a_base() {
            bail!("Relay URL cannot be used as a base: {base_url}");
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { http, base })
    }

    /// Session ids are client generated, so each one is pushed as its own path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("Relay URL cannot be used as a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Returns whether the session was newly created.
    pub async fn create_session(&self, session_id: &str) -> Result<bool> {
        let url = self.endpoint(&["api", "chat", "sessions", session_id])?;
        let resp = self.http.put(url).send().await?;
        let body: SessionResponse = read_json(resp).await?;
        Ok(body.created)
    }

    pub async fn send_message(&self, session_id: &str, message: &str) -> Result<SendMessageResponse> {
        let url = self.endpoint(&["api", "chat", "messages"])?;
        let resp = self
            .http
            .post(url)
            .json(&json!({ "message": message, "sessionId": session_id }))
            .send()
            .await?;
        read_json(resp).await
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let url = self.endpoint(&["api", "chat", "sessions", session_id, "messages"])?;
        let resp = self.http.get(url).send().await?;
        read_json(resp).await
    }

    /// Opens the per-session event stream. The caller reads the SSE body.
    pub async fn session_events(&self, session_id: &str) -> Result<Response> {
        let url = self.endpoint(&["api", "chat", "sessions", session_id, "events"])?;
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            bail!("Relay refused event stream: {}", resp.status());
        }
        Ok(resp)
    }
}

#[async_trait]
impl SessionRegistry for RelayClient {
    async fn register_session(&self, session_id: &str) -> Result<()> {
        self.create_session(session_id).await?;
        Ok(())
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return resp.json().await.context("Unexpected response from relay");
    }

    let text = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => bail!("Relay returned {}: {}", status, body.error),
        Err(_) => bail!("Relay returned {}", status),
    }
}
