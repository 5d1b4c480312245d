//! **Dialog** — sends the user's utterance to the companion's dialog service
//! and returns its reply text.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Backend that answers a user utterance. Failures surface as `ServiceUnavailable`.
#[async_trait]
pub trait DialogService: Send + Sync {
    async fn send(&self, user_id: &str, text: &str) -> VoiceResult<String>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest<'a> {
    user_id: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    text: String,
}

/// Dialog service over HTTP: `POST {base}/chat` with `{userId, text}`, reply `{text}`.
/// Uses `DIALOG_API_URL` and optionally `DIALOG_API_KEY` (bearer).
#[derive(Debug, Clone)]
pub struct HttpDialogClient {
    /// Base URL without trailing slash
    pub base_url: String,
    pub api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpDialogClient {
    /// Build from environment: DIALOG_API_URL (required), DIALOG_API_KEY.
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("DIALOG_API_URL")
            .map_err(|_| VoiceError::Config("Dialog client requires DIALOG_API_URL".to_string()))?;
        let api_key = std::env::var("DIALOG_API_KEY").ok().filter(|k| !k.trim().is_empty());
        Self::new(base_url, api_key)
    }

    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl DialogService for HttpDialogClient {
    async fn send(&self, user_id: &str, text: &str) -> VoiceResult<String> {
        let url = format!("{}/chat", self.base_url);
        let mut request = self.client.post(&url).json(&ChatRequest { user_id, text });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let res = request.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::ServiceUnavailable(format!(
                "Dialog API error {}: {}",
                status, body
            )));
        }
        let reply: ChatReply = res.json().await?;
        debug!(chars = reply.text.len(), "dialog reply");
        Ok(reply.text)
    }
}

/// Placeholder dialog: echoes the utterance back. Use to exercise the voice loop without a backend.
#[derive(Debug, Default)]
pub struct PlaceholderDialog {
    /// If set, return this instead of the echo.
    pub response: Option<String>,
}

impl PlaceholderDialog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

#[async_trait]
impl DialogService for PlaceholderDialog {
    async fn send(&self, _user_id: &str, text: &str) -> VoiceResult<String> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        Ok(format!("You said: {}", text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_camel_case_fields() {
        let body = serde_json::to_value(ChatRequest {
            user_id: "u-1",
            text: "hi",
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({ "userId": "u-1", "text": "hi" }));
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        let client = HttpDialogClient::new("http://localhost:9000/", None).unwrap();
        assert_eq!(client.base_url, "http://localhost:9000");
    }

    #[tokio::test]
    async fn placeholder_echoes() {
        let dialog = PlaceholderDialog::new();
        assert_eq!(dialog.send("u", "hello").await.unwrap(), "You said: hello");

        let fixed = PlaceholderDialog::with_response("hey");
        assert_eq!(fixed.send("u", "hello").await.unwrap(), "hey");
    }

    #[tokio::test]
    async fn unreachable_service_is_unavailable() {
        // Port 9 (discard) is closed on test machines; connection is refused
        let client = HttpDialogClient::new("http://127.0.0.1:9", None).unwrap();
        let err = client.send("u", "hello").await.unwrap_err();
        assert!(matches!(err, VoiceError::ServiceUnavailable(_)));
    }
}
