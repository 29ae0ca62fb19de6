//! Direct connection to the locally running LLM service.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::ChatRequest;
use crate::transport::http::HttpEndpoint;
use crate::transport::{StreamEvent, Transport, TransportId};

/// The local service is probed at `/api/version` and streamed from
/// `/api/chat`. It never receives the bearer token.
pub struct LocalTransport {
    http: HttpEndpoint,
}

impl LocalTransport {
    pub fn new(base_url: String, connect_timeout: Duration) -> Self {
        Self {
            http: HttpEndpoint::new(base_url, None, connect_timeout),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn id(&self) -> TransportId {
        TransportId::Local
    }

    fn endpoint(&self) -> &str {
        &self.http.base_url
    }

    async fn health_check(&self) -> Result<Duration, String> {
        self.http.probe("/api/version").await
    }

    fn open_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.http.spawn_stream("/api/chat", request, cancel, tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_identity_and_endpoint() {
        let transport = LocalTransport::new(
            "http://localhost:11434".to_string(),
            Duration::from_secs(5),
        );
        assert_eq!(transport.id(), TransportId::Local);
        assert_eq!(transport.endpoint(), "http://localhost:11434");
    }
}
