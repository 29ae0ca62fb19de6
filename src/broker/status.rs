//! Connection status types and the snapshot broadcaster.
//!
//! Subscribers get the current snapshot immediately on subscribe, then every
//! subsequent snapshot. There is no replay buffer. Publishing goes through
//! unbounded senders so it never blocks the broker's control flow; a slow
//! subscriber buffers on its own channel.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::broker::classify::ConnectionError;
use crate::transport::TransportId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Error,
    Reconnecting,
}

/// Status of one transport candidate. Mutated only by the broker;
/// everything handed out is an owned clone.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub transport: TransportId,
    pub state: ConnectionState,
    pub endpoint: String,
    pub last_activity: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub latency_ms: Option<u64>,
    pub error: Option<ConnectionError>,
}

impl ConnectionStatus {
    pub fn new(transport: TransportId, endpoint: String) -> Self {
        Self {
            transport,
            state: ConnectionState::Disconnected,
            endpoint,
            last_activity: None,
            reconnect_attempts: 0,
            latency_ms: None,
            error: None,
        }
    }
}

/// Aggregate view published on every state transition.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub active: Option<TransportId>,
    pub any_connected: bool,
    pub transports: Vec<ConnectionStatus>,
}

impl StatusSnapshot {
    pub fn status_of(&self, transport: TransportId) -> Option<&ConnectionStatus> {
        self.transports.iter().find(|s| s.transport == transport)
    }
}

#[derive(Default)]
struct BroadcasterInner {
    latest: Option<StatusSnapshot>,
    subscribers: Vec<mpsc::UnboundedSender<StatusSnapshot>>,
}

/// Fan-out point for status snapshots. Dropping the receiver returned by
/// [`subscribe`](StatusBroadcaster::subscribe) unsubscribes; the dead sender
/// is pruned on the next publish.
#[derive(Clone, Default)]
pub struct StatusBroadcaster {
    inner: Arc<Mutex<BroadcasterInner>>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: StatusSnapshot) {
        let mut inner = self.inner.lock().expect("status broadcaster poisoned");
        inner
            .subscribers
            .retain(|tx| tx.send(snapshot.clone()).is_ok());
        inner.latest = Some(snapshot);
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StatusSnapshot> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("status broadcaster poisoned");
        if let Some(latest) = &inner.latest {
            let _ = tx.send(latest.clone());
        }
        inner.subscribers.push(tx);
        rx
    }

    pub fn latest(&self) -> Option<StatusSnapshot> {
        self.inner
            .lock()
            .expect("status broadcaster poisoned")
            .latest
            .clone()
    }
}
