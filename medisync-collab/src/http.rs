//! [`SyncBackend`] over HTTP/JSON.
//!
//! | Operation        | Request                                              | Response                    |
//! |------------------|------------------------------------------------------|-----------------------------|
//! | upload changes   | `POST {base}/document/{docId}/changes {changes:[b64]}` | any 2xx                   |
//! | fetch snapshot   | `GET {base}/document/{docId}`                        | `{bin: b64 \| null}`, 404 = none |
//! | upload offline   | `POST {base}/offline/upload {items:[…]}`             | 2xx, optional `{accepted:[i]}` |
//!
//! Document ids are percent-encoded as single path segments. An offline
//! upload answered with an empty body, or with JSON that has no `accepted`
//! list, accepts the whole batch; any other body that cannot be read leaves
//! the batch queued.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::bridge::{BridgeError, SyncBackend, UploadReceipt};
use crate::offline::OfflineEvent;

/// HTTP backend settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// API root, e.g. `https://clinic.example.org/api`
    pub base_url: String,
    /// Sent as `Authorization: Bearer …` when set
    pub token: Option<String>,
    pub request_timeout: Duration,
}

impl HttpConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Serialize)]
struct ChangesBody {
    changes: Vec<String>,
}

#[derive(Deserialize)]
struct SnapshotBody {
    #[serde(default)]
    bin: Option<String>,
}

#[derive(Serialize)]
struct OfflineBody<'a> {
    items: &'a [OfflineEvent],
}

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(config: HttpConfig) -> Result<Self, BridgeError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| BridgeError::InvalidUrl(format!("{}: {e}", config.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(BridgeError::InvalidUrl(config.base_url));
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url,
            token: config.token,
        })
    }

    /// Base URL with `segments` appended, each percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, BridgeError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| BridgeError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, BridgeError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BridgeError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl SyncBackend for HttpBackend {
    async fn upload_changes(&self, doc_id: &str, changes: &[Vec<u8>]) -> Result<(), BridgeError> {
        let body = ChangesBody {
            changes: changes.iter().map(|c| STANDARD.encode(c)).collect(),
        };
        let request = self
            .client
            .post(self.url(&["document", doc_id, "changes"])?)
            .json(&body);
        Self::check(self.authorized(request).send().await?).await?;
        Ok(())
    }

    async fn fetch_snapshot(&self, doc_id: &str) -> Result<Option<Vec<u8>>, BridgeError> {
        let request = self.client.get(self.url(&["document", doc_id])?);
        let response = self.authorized(request).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: SnapshotBody = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| BridgeError::InvalidResponse(e.to_string()))?;

        match body.bin {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(|e| BridgeError::InvalidResponse(e.to_string())),
            None => Ok(None),
        }
    }

    async fn upload_offline(&self, items: &[OfflineEvent]) -> Result<UploadReceipt, BridgeError> {
        let request = self
            .client
            .post(self.url(&["offline", "upload"])?)
            .json(&OfflineBody { items });
        let response = Self::check(self.authorized(request).send().await?).await?;

        let bytes = response.bytes().await?;
        parse_receipt(&bytes)
    }
}

fn parse_receipt(body: &[u8]) -> Result<UploadReceipt, BridgeError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(UploadReceipt::all());
    }
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| BridgeError::InvalidResponse(format!("offline upload reply: {e}")))?;
    match value.get("accepted") {
        None | Some(serde_json::Value::Null) => Ok(UploadReceipt::all()),
        Some(accepted) => serde_json::from_value(accepted.clone())
            .map(UploadReceipt::only)
            .map_err(|e| BridgeError::InvalidResponse(format!("accepted indices: {e}"))),
    }
}
