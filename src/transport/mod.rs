//! Transport candidates: the interchangeable ways of reaching the backend.
//!
//! Every candidate sits behind the [`Transport`] trait with the same narrow
//! capability set, so the broker can treat local, cloud-relay, and
//! public-tunnel backends uniformly.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{ChatRequest, StreamingMessage};

pub mod cloud;
pub mod http;
pub mod local;
pub mod tunnel;

pub use cloud::CloudRelayTransport;
pub use local::LocalTransport;
pub use tunnel::PublicTunnelTransport;

/// Identity of a transport candidate, in default priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportId {
    Local,
    CloudRelay,
    PublicTunnel,
}

impl TransportId {
    pub fn label(&self) -> &'static str {
        match self {
            TransportId::Local => "local",
            TransportId::CloudRelay => "cloud_relay",
            TransportId::PublicTunnel => "public_tunnel",
        }
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What a transport reports back while a chat stream is open.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// One parsed wire chunk.
    Message(StreamingMessage),
    /// Raw failure text from the transport; the broker classifies it.
    Failed(String),
    /// The stream ended without a terminal chunk.
    Closed,
}

/// Uniform capability implemented per backend kind.
///
/// Implementations never classify their own failures: health probes and
/// stream events carry raw error text so classification stays centralized
/// in the broker.
#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> TransportId;

    fn endpoint(&self) -> &str;

    /// Bounded-time reachability check. Returns the measured round-trip
    /// latency on success, raw failure text otherwise.
    async fn health_check(&self) -> Result<Duration, String>;

    /// Opens a chat exchange and returns the event stream for it. The
    /// transport task stops promptly when `cancel` fires.
    fn open_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<StreamEvent>;

    /// Releases transport-held resources. The HTTP candidates hold nothing
    /// beyond a pooled client, so the default is a no-op.
    async fn close(&self) {}
}
