//! Authenticated connection through the cloud relay.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::ChatRequest;
use crate::transport::http::HttpEndpoint;
use crate::transport::{StreamEvent, Transport, TransportId};

const MISSING_TOKEN: &str = "authentication required: no bearer token configured for cloud relay";

/// The relay maps the local chat API under `/api/ollama`; its own health
/// endpoint is `/health`. Requests carry the bearer token obtained from the
/// external auth collaborator. Without a token the candidate fails fast
/// instead of sending unauthenticated requests at the relay.
pub struct CloudRelayTransport {
    http: HttpEndpoint,
    has_token: bool,
}

impl CloudRelayTransport {
    pub fn new(base_url: String, auth_token: Option<String>, connect_timeout: Duration) -> Self {
        let has_token = auth_token.is_some();
        Self {
            http: HttpEndpoint::new(base_url, auth_token, connect_timeout),
            has_token,
        }
    }
}

#[async_trait]
impl Transport for CloudRelayTransport {
    fn id(&self) -> TransportId {
        TransportId::CloudRelay
    }

    fn endpoint(&self) -> &str {
        &self.http.base_url
    }

    async fn health_check(&self) -> Result<Duration, String> {
        if !self.has_token {
            return Err(MISSING_TOKEN.to_string());
        }
        self.http.probe("/health").await
    }

    fn open_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.has_token {
            let _ = tx.send(StreamEvent::Failed(MISSING_TOKEN.to_string()));
            return rx;
        }
        self.http
            .spawn_stream("/api/ollama/api/chat", request, cancel, tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_token_fails_probe_without_network() {
        let transport = CloudRelayTransport::new(
            "https://relay.example.com".to_string(),
            None,
            Duration::from_secs(5),
        );
        let err = transport.health_check().await.unwrap_err();
        assert!(err.contains("authentication required"));
    }

    #[tokio::test]
    async fn missing_token_fails_stream_immediately() {
        let transport = CloudRelayTransport::new(
            "https://relay.example.com".to_string(),
            None,
            Duration::from_secs(5),
        );
        let request = ChatRequest::new("llama3", Vec::new());
        let mut rx = transport.open_stream(request, CancellationToken::new());
        match rx.recv().await.expect("expected an event") {
            StreamEvent::Failed(raw) => assert!(raw.contains("no bearer token")),
            other => panic!("expected failure event, got {:?}", other),
        }
    }

    #[test]
    fn reports_identity() {
        let transport = CloudRelayTransport::new(
            "https://relay.example.com".to_string(),
            Some("tok".to_string()),
            Duration::from_secs(5),
        );
        assert_eq!(transport.id(), TransportId::CloudRelay);
        assert_eq!(transport.endpoint(), "https://relay.example.com");
    }
}
