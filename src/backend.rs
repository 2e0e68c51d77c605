//! Backend client interface (component C).
//!
//! A thin async wrapper around a single inference backend's HTTP surface:
//! chat completions (JSON or streamed), and the llama.cpp-style `/slots/{id}`
//! save/restore operations. An `async_trait` over a shared `reqwest::Client`,
//! with a much smaller surface than a general-purpose provider client, since
//! this proxy only ever talks OpenAI-shaped chat completions to one kind of
//! backend.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

pub type ChatByteStream = std::pin::Pin<Box<dyn Stream<Item = Result<Bytes, BackendError>> + Send>>;

/// The response of a streamed chat request's preflight: either the stream is
/// ready to forward (status already confirmed 2xx), or it failed and the
/// caller gets the status and drained error body instead.
pub enum StreamPreflight {
    Ready { status: StatusCode, stream: ChatByteStream },
    Failed { status: StatusCode, body: String },
}

#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Non-streaming chat completion; returns the raw JSON body.
    async fn chat_json(&self, body: Value, slot_id: u32) -> Result<Value, BackendError>;

    /// Streaming chat completion. Performs the preflight status check itself
    /// so callers never have to peek into a stream to classify failure.
    async fn chat_stream(&self, body: Value, slot_id: u32) -> Result<StreamPreflight, BackendError>;

    /// Persists a slot's KV-cache under `basename` on the backend's
    /// `--slot-save-path`. Best-effort: failures are reported, not retried.
    async fn save_slot(&self, local_slot_id: u32, basename: &str) -> Result<(), BackendError>;

    /// Restores a previously saved KV-cache into a slot.
    async fn restore_slot(&self, local_slot_id: u32, basename: &str) -> Result<(), BackendError>;
}

/// Injects the slot identifier into every placement a backend build might
/// look for it in: body-root fields, a nested `options` object, and (by the
/// caller, via `url_with_slot_query`) the URL query string. Different
/// llama.cpp-derived backends have historically recognised different
/// placements, so this proxy sets all of them rather than guessing one.
pub fn with_redundant_slot_id(mut body: Value, slot_id: u32) -> Value {
    if let Value::Object(ref mut map) = body {
        map.insert("slot_id".to_string(), Value::from(slot_id));
        map.insert("id_slot".to_string(), Value::from(slot_id));
        map.insert("_slot_id".to_string(), Value::from(slot_id));
        let mut options = Map::new();
        options.insert("slot_id".to_string(), Value::from(slot_id));
        map.insert("options".to_string(), Value::Object(options));
    }
    body
}

pub struct ReqwestBackendClient {
    base_url: String,
    client: Client,
}

impl ReqwestBackendClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn chat_url(&self, slot_id: u32) -> String {
        format!("{}/v1/chat/completions?slot_id={}", self.base_url, slot_id)
    }

    fn slot_url(&self, local_slot_id: u32, action: &str) -> String {
        format!("{}/slots/{}?action={}", self.base_url, local_slot_id, action)
    }
}

#[async_trait]
impl BackendClient for ReqwestBackendClient {
    async fn chat_json(&self, body: Value, slot_id: u32) -> Result<Value, BackendError> {
        let body = with_redundant_slot_id(body, slot_id);
        let resp = self.client.post(self.chat_url(slot_id)).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, body: text });
        }
        Ok(resp.json().await?)
    }

    async fn chat_stream(&self, body: Value, slot_id: u32) -> Result<StreamPreflight, BackendError> {
        let body = with_redundant_slot_id(body, slot_id);
        let resp = self.client.post(self.chat_url(slot_id)).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Ok(StreamPreflight::Failed { status, body: text });
        }
        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(BackendError::from));
        Ok(StreamPreflight::Ready {
            status,
            stream: Box::pin(stream),
        })
    }

    async fn save_slot(&self, local_slot_id: u32, basename: &str) -> Result<(), BackendError> {
        let resp = self
            .client
            .post(self.slot_url(local_slot_id, "save"))
            .json(&serde_json::json!({ "filename": basename }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, body: text });
        }
        Ok(())
    }

    async fn restore_slot(&self, local_slot_id: u32, basename: &str) -> Result<(), BackendError> {
        let resp = self
            .client
            .post(self.slot_url(local_slot_id, "restore"))
            .json(&serde_json::json!({ "filename": basename }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, body: text });
        }
        Ok(())
    }
}

use futures_util::StreamExt;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redundant_slot_id_sets_every_placement() {
        let body = serde_json::json!({"messages": []});
        let out = with_redundant_slot_id(body, 7);
        assert_eq!(out["slot_id"], 7);
        assert_eq!(out["id_slot"], 7);
        assert_eq!(out["_slot_id"], 7);
        assert_eq!(out["options"]["slot_id"], 7);
    }

    #[tokio::test]
    async fn chat_json_round_trips_through_wiremock() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "x"})))
            .mount(&server)
            .await;

        let client = ReqwestBackendClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let resp = client
            .chat_json(serde_json::json!({"messages": []}), 0)
            .await
            .unwrap();
        assert_eq!(resp["id"], "x");
    }

    #[tokio::test]
    async fn save_slot_surfaces_backend_error_status() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/slots/0"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = ReqwestBackendClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = client.save_slot(0, "deadbeef").await.unwrap_err();
        matches!(err, BackendError::Status { .. });
    }
}
