//! Shared HTTP plumbing for the transport candidates.
//!
//! All three candidates speak the same wire protocol: a JSON POST opens the
//! exchange and the response body is newline-delimited `StreamingMessage`
//! JSON. The cloud relay proxies SSE, so a `data:` prefix and the `[DONE]`
//! sentinel are tolerated on any line.

use std::time::Duration;

use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::api::{ChatRequest, StreamingMessage};
use crate::transport::StreamEvent;

/// Join a base URL and a path without producing double slashes.
pub(crate) fn endpoint_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Flatten a reqwest error into text that keeps the underlying cause
/// visible ("Connection refused", "timed out", DNS failures), since the
/// classifier works on raw failure signatures.
pub(crate) fn request_error_text(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        return format!("request timed out: {err}");
    }
    let mut text = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

/// One HTTP backend endpoint plus the credentials and timeout to use
/// against it. `auth_token` is `None` for the local service only.
#[derive(Clone)]
pub(crate) struct HttpEndpoint {
    client: reqwest::Client,
    pub(crate) base_url: String,
    auth_token: Option<String>,
    timeout: Duration,
}

impl HttpEndpoint {
    pub(crate) fn new(base_url: String, auth_token: Option<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            auth_token,
            timeout,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    /// Bounded-time reachability probe. Returns measured latency.
    pub(crate) async fn probe(&self, path: &str) -> Result<Duration, String> {
        let url = endpoint_url(&self.base_url, path);
        let started = Instant::now();
        let request = self.authorize(self.client.get(&url).timeout(self.timeout));

        match request.send().await {
            Ok(response) if response.status().is_success() => Ok(started.elapsed()),
            Ok(response) => Err(format!("HTTP {}", response.status())),
            Err(err) => Err(request_error_text(&err)),
        }
    }

    /// Spawns the request/stream task for one chat exchange. Events land on
    /// `tx`; the task exits as soon as `cancel` fires.
    pub(crate) fn spawn_stream(
        &self,
        path: &str,
        request: ChatRequest,
        cancel: CancellationToken,
        tx: mpsc::UnboundedSender<StreamEvent>,
    ) {
        let client = self.client.clone();
        let url = endpoint_url(&self.base_url, path);
        let auth_token = self.auth_token.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = run_stream(client, url, auth_token, request, tx) => {}
                _ = cancel.cancelled() => {}
            }
        });
    }
}

async fn run_stream(
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
    request: ChatRequest,
    tx: mpsc::UnboundedSender<StreamEvent>,
) {
    let mut http_request = client.post(&url).header("Content-Type", "application/json");
    if let Some(token) = &auth_token {
        http_request = http_request.header("Authorization", format!("Bearer {token}"));
    }

    let response = match http_request.json(&request).send().await {
        Ok(response) => response,
        Err(err) => {
            let _ = tx.send(StreamEvent::Failed(request_error_text(&err)));
            return;
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        let _ = tx.send(StreamEvent::Failed(format!("HTTP {status}: {body}")));
        return;
    }

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = tx.send(StreamEvent::Failed(request_error_text(&err)));
                return;
            }
        };

        buffer.extend_from_slice(&bytes);
        while let Some(newline_pos) = memchr(b'\n', &buffer) {
            let line = match std::str::from_utf8(&buffer[..newline_pos]) {
                Ok(s) => s.trim().to_string(),
                Err(err) => {
                    warn!("invalid UTF-8 in stream: {err}");
                    buffer.drain(..=newline_pos);
                    continue;
                }
            };

            let done = handle_line(&line, &tx);
            buffer.drain(..=newline_pos);
            if done {
                return;
            }
        }
    }

    let _ = tx.send(StreamEvent::Closed);
}

/// Processes one framed line. Returns true once the stream is over.
fn handle_line(line: &str, tx: &mpsc::UnboundedSender<StreamEvent>) -> bool {
    if line.is_empty() {
        return false;
    }

    let payload = line
        .strip_prefix("data:")
        .map(str::trim_start)
        .unwrap_or(line);

    if payload == "[DONE]" {
        let _ = tx.send(StreamEvent::Closed);
        return true;
    }

    match serde_json::from_str::<StreamingMessage>(payload) {
        Ok(message) => {
            let terminal = message.is_terminal();
            let _ = tx.send(StreamEvent::Message(message));
            terminal
        }
        Err(_) => {
            // Not a wire chunk; treat the payload (e.g. a JSON error body
            // from the backend) as a raw transport failure.
            let _ = tx.send(StreamEvent::Failed(payload.to_string()));
            true
        }
    }
}
