//! Connection through a public ingress tunnel that fronts the local service.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::ChatRequest;
use crate::transport::http::HttpEndpoint;
use crate::transport::{StreamEvent, Transport, TransportId};

/// The tunnel forwards to the local service, so it speaks the same paths as
/// [`LocalTransport`](crate::transport::local::LocalTransport), but the
/// ingress requires the bearer token.
pub struct PublicTunnelTransport {
    http: HttpEndpoint,
}

impl PublicTunnelTransport {
    pub fn new(base_url: String, auth_token: Option<String>, connect_timeout: Duration) -> Self {
        Self {
            http: HttpEndpoint::new(base_url, auth_token, connect_timeout),
        }
    }
}

#[async_trait]
impl Transport for PublicTunnelTransport {
    fn id(&self) -> TransportId {
        TransportId::PublicTunnel
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
    fn reports_identity() {
        let transport = PublicTunnelTransport::new(
            "https://tunnel.example.com".to_string(),
            Some("tok".to_string()),
            Duration::from_secs(5),
        );
        assert_eq!(transport.id(), TransportId::PublicTunnel);
        assert_eq!(transport.endpoint(), "https://tunnel.example.com");
    }
}
