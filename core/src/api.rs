use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use models::RemoteConfig;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Outcome of the credential/health probe against `GET /agent/check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// 200: endpoint reachable, credential accepted.
    Valid,
    /// 401/403: the key was rejected.
    InvalidKey(u16),
    /// Any other non-200, treated as transient.
    Unexpected(u16),
}

/// Raw result of a single upload attempt. Retry policy lives with the
/// caller so back-off can observe shutdown.
#[derive(Debug, Clone)]
pub struct UploadResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl UploadResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait IngestApi: Send + Sync {
    async fn check(&self, remote: &RemoteConfig) -> Result<CheckOutcome>;
    async fn upload(
        &self,
        remote: &RemoteConfig,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadResponse>;
}

/// Extract the server-advertised hash from an upload response body. The
/// handshake is optional: a body that is not JSON, or JSON without a
/// `sha256` string field, yields `None` and success stands.
pub fn parse_server_hash(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("sha256")?.as_str().map(|s| s.to_string())
}

fn endpoint_url(remote: &RemoteConfig, path: &str) -> String {
    format!("{}{}", remote.endpoint.trim_end_matches('/'), path)
}

/* Real client (reqwest) */

#[derive(Debug, Clone, Default)]
pub struct HttpIngestApi {
    client: reqwest::Client,
}

impl HttpIngestApi {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl IngestApi for HttpIngestApi {
    async fn check(&self, remote: &RemoteConfig) -> Result<CheckOutcome> {
        let resp = self
            .client
            .get(endpoint_url(remote, "/agent/check"))
            .bearer_auth(&remote.key)
            .send()
            .await?;
        Ok(match resp.status().as_u16() {
            200 => CheckOutcome::Valid,
            s @ (401 | 403) => CheckOutcome::InvalidKey(s),
            s => CheckOutcome::Unexpected(s),
        })
    }

    async fn upload(
        &self,
        remote: &RemoteConfig,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadResponse> {
        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string()),
        );
        let resp = self
            .client
            .post(endpoint_url(remote, "/agent/upload"))
            .bearer_auth(&remote.key)
            .multipart(form)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
        Ok(UploadResponse { status, body })
    }
}

/// Heartbeat: probe the endpoint once a minute so credential problems show
/// up in the log long before the next upload.
pub async fn pinger(api: Arc<dyn IngestApi>, remote: RemoteConfig, token: CancellationToken) {
    let mut ticker = interval(Duration::from_secs(60));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                match api.check(&remote).await {
                    Ok(CheckOutcome::Valid) => {}
                    Ok(CheckOutcome::InvalidKey(status)) | Ok(CheckOutcome::Unexpected(status)) => {
                        warn!("[{}] Heartbeat rejected: status {}", remote.name, status);
                    }
                    Err(e) => warn!("[{}] Heartbeat failed: {e:#}", remote.name),
                }
            }
        }
    }
}

/* Virtual client for tests */

/// Scripted in-memory implementation: uploads are recorded, responses are
/// served from a queue (default 200 with an empty body when the queue runs
/// dry).
#[derive(Debug)]
pub struct VirtualIngestApi {
    inner: Mutex<VirtualApiInner>,
}

#[derive(Debug)]
struct VirtualApiInner {
    check_status: u16,
    responses: VecDeque<UploadResponse>,
    uploads: Vec<RecordedUpload>,
    upload_delay: Duration,
    in_flight: usize,
    max_in_flight: usize,
}

#[derive(Debug, Clone)]
pub struct RecordedUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl Default for VirtualIngestApi {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualIngestApi {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VirtualApiInner {
                check_status: 200,
                responses: VecDeque::new(),
                uploads: Vec::new(),
                upload_delay: Duration::ZERO,
                in_flight: 0,
                max_in_flight: 0,
            }),
        }
    }

    pub fn set_check_status(&self, status: u16) {
        self.inner.lock().unwrap().check_status = status;
    }

    /// Make every upload take this long, so tests can observe how many run
    /// at once.
    pub fn set_upload_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().upload_delay = delay;
    }

    /// High-water mark of simultaneous uploads.
    pub fn max_in_flight(&self) -> usize {
        self.inner.lock().unwrap().max_in_flight
    }

    pub fn push_upload_response(&self, status: u16, body: &[u8]) {
        self.inner.lock().unwrap().responses.push_back(UploadResponse {
            status,
            body: body.to_vec(),
        });
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.inner.lock().unwrap().uploads.clone()
    }

    pub fn upload_count(&self) -> usize {
        self.inner.lock().unwrap().uploads.len()
    }
}

#[async_trait]
impl IngestApi for VirtualIngestApi {
    async fn check(&self, _remote: &RemoteConfig) -> Result<CheckOutcome> {
        let status = self.inner.lock().unwrap().check_status;
        Ok(match status {
            200 => CheckOutcome::Valid,
            s @ (401 | 403) => CheckOutcome::InvalidKey(s),
            s => CheckOutcome::Unexpected(s),
        })
    }

    async fn upload(
        &self,
        _remote: &RemoteConfig,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadResponse> {
        let delay = {
            let mut inner = self.inner.lock().unwrap();
            inner.uploads.push(RecordedUpload {
                file_name: file_name.to_string(),
                bytes,
            });
            inner.in_flight += 1;
            inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
            inner.upload_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight -= 1;
        Ok(inner.responses.pop_front().unwrap_or(UploadResponse {
            status: 200,
            body: Vec::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::{endpoint_url, parse_server_hash};
    use models::RemoteConfig;
    use std::path::PathBuf;

    fn remote(endpoint: &str) -> RemoteConfig {
        RemoteConfig {
            name: "r".to_string(),
            path: PathBuf::from("/watch"),
            endpoint: endpoint.to_string(),
            key: "k".to_string(),
            stability_threshold: 0,
            check_interval: String::new(),
            stability_timeout: String::new(),
            concurrency_limit: 0,
            polling_interval: String::new(),
            settling_delay: String::new(),
            disable_fsnotify: true,
        }
    }

    #[test]
    fn endpoint_url_strips_trailing_slashes() {
        let r = remote("https://api.example.com/");
        assert_eq!(
            endpoint_url(&r, "/agent/upload"),
            "https://api.example.com/agent/upload"
        );
        let r = remote("https://api.example.com");
        assert_eq!(
            endpoint_url(&r, "/agent/check"),
            "https://api.example.com/agent/check"
        );
    }

    #[tokio::test]
    async fn virtual_check_maps_statuses_to_outcomes() {
        use super::{CheckOutcome, IngestApi, VirtualIngestApi};
        let api = VirtualIngestApi::new();
        let r = remote("https://api.example.com");

        assert_eq!(api.check(&r).await.unwrap(), CheckOutcome::Valid);
        api.set_check_status(401);
        assert_eq!(api.check(&r).await.unwrap(), CheckOutcome::InvalidKey(401));
        api.set_check_status(503);
        assert_eq!(api.check(&r).await.unwrap(), CheckOutcome::Unexpected(503));
    }

    #[test]
    fn server_hash_is_parsed_only_from_json_objects() {
        assert_eq!(
            parse_server_hash(br#"{"sha256":"abc123"}"#),
            Some("abc123".to_string())
        );
        assert_eq!(parse_server_hash(br#"{"ok":true}"#), None);
        assert_eq!(parse_server_hash(b"uploaded"), None);
        assert_eq!(parse_server_hash(b""), None);
        assert_eq!(parse_server_hash(br#"{"sha256":42}"#), None);
    }
}
