//! The connection broker: selects among transport candidates, retries with
//! backoff, classifies failures, and supervises the active connection.
//!
//! The broker is the single writer for all connection state. External code
//! sees immutable snapshots through the [`status::StatusBroadcaster`] and
//! receives raw wire chunks from [`ConnectionBroker::send_message`]; transport
//! failures never surface as errors past the broker, they become status
//! fields.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ChatRequest, StreamingMessage};
use crate::broker::classify::{classify, ConnectionError, ErrorKind};
use crate::broker::retry::{RetryPolicy, RetryState};
use crate::broker::status::{
    ConnectionState, ConnectionStatus, StatusBroadcaster, StatusSnapshot,
};
use crate::core::config::Config;
use crate::transport::{
    CloudRelayTransport, LocalTransport, PublicTunnelTransport, StreamEvent, Transport,
    TransportId,
};

pub mod assembler;
pub mod classify;
pub mod retry;
pub mod status;

#[derive(Debug, Clone, Copy)]
pub struct BrokerSettings {
    pub prefer_local: bool,
    pub health_check_interval: Duration,
    pub retry_policy: RetryPolicy,
}

impl BrokerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            prefer_local: config.prefer_local,
            health_check_interval: config.health_check_interval(),
            retry_policy: RetryPolicy::new(
                config.base_retry_delay(),
                config.max_retry_delay(),
                config.max_retry_attempts,
            ),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            prefer_local: true,
            health_check_interval: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
        }
    }
}

struct BrokerState {
    statuses: HashMap<TransportId, ConnectionStatus>,
    retries: HashMap<TransportId, RetryState>,
    active: Option<TransportId>,
    streaming: bool,
    /// Healthier higher-priority candidate found mid-stream; applied only at
    /// the next message boundary, never during an in-flight stream.
    pending_switch: Option<TransportId>,
    /// Candidates that hit an authentication failure. Suppressed from
    /// automatic retry until the next explicit `connect()`.
    auth_suppressed: HashSet<TransportId>,
}

struct Session {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct BrokerInner {
    candidates: Vec<Arc<dyn Transport>>,
    settings: BrokerSettings,
    state: Mutex<BrokerState>,
    broadcaster: StatusBroadcaster,
    session: Mutex<Session>,
}

/// Cheap-to-clone handle; all clones share the same broker.
#[derive(Clone)]
pub struct ConnectionBroker {
    inner: Arc<BrokerInner>,
}

impl ConnectionBroker {
    /// Builds a broker over an explicit, priority-ordered candidate list.
    pub fn new(candidates: Vec<Arc<dyn Transport>>, settings: BrokerSettings) -> Self {
        let statuses = candidates
            .iter()
            .map(|t| {
                (
                    t.id(),
                    ConnectionStatus::new(t.id(), t.endpoint().to_string()),
                )
            })
            .collect();
        let retries = candidates
            .iter()
            .map(|t| (t.id(), RetryState::new(settings.retry_policy)))
            .collect();

        let cancelled = CancellationToken::new();
        cancelled.cancel();

        Self {
            inner: Arc::new(BrokerInner {
                candidates,
                settings,
                state: Mutex::new(BrokerState {
                    statuses,
                    retries,
                    active: None,
                    streaming: false,
                    pending_switch: None,
                    auth_suppressed: HashSet::new(),
                }),
                broadcaster: StatusBroadcaster::new(),
                session: Mutex::new(Session {
                    cancel: cancelled,
                    tasks: Vec::new(),
                }),
            }),
        }
    }

    /// Builds the default candidate set from configuration: local, then
    /// cloud relay, then public tunnel. The bearer token is attached to the
    /// relay and tunnel candidates only.
    pub fn from_config(config: &Config, auth_token: Option<String>) -> Self {
        let timeout = config.connect_timeout();
        let mut candidates: Vec<Arc<dyn Transport>> = vec![Arc::new(LocalTransport::new(
            config.local_url.clone(),
            timeout,
        ))];

        if let Some(relay_url) = &config.cloud_relay_url {
            candidates.push(Arc::new(CloudRelayTransport::new(
                relay_url.clone(),
                auth_token.clone(),
                timeout,
            )));
        }

        if config.enable_public_tunnel {
            if let Some(tunnel_url) = &config.public_tunnel_url {
                let token = config.public_tunnel_auth_token.clone().or(auth_token);
                candidates.push(Arc::new(PublicTunnelTransport::new(
                    tunnel_url.clone(),
                    token,
                    timeout,
                )));
            }
        }

        Self::new(candidates, BrokerSettings::from_config(config))
    }

    /// Starts a connection session: runs one full candidate cycle, then
    /// leaves a retry loop (if nothing connected) and the periodic
    /// re-validation monitor running in the background. Returns the status
    /// snapshot after the first cycle.
    pub async fn connect(&self) -> StatusSnapshot {
        let cancel = self.inner.begin_session().await;
        self.inner.publish().await;

        let connected = self
            .inner
            .run_cycle(cancel.clone(), true, ConnectionState::Connecting, None)
            .await;

        if !connected && !cancel.is_cancelled() {
            let retry_inner = self.inner.clone();
            let retry_cancel = cancel.clone();
            let handle = tokio::spawn(async move {
                retry_inner.retry_loop(retry_cancel).await;
            });
            self.inner.track_task(handle).await;
        }

        let monitor_inner = self.inner.clone();
        let monitor_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            monitor_inner.monitor_loop(monitor_cancel).await;
        });
        self.inner.track_task(handle).await;

        self.inner.snapshot().await
    }

    /// Cancels all in-flight probes, streams, and timers, and suppresses
    /// automatic retries until `connect()` is called again.
    pub async fn disconnect(&self) {
        {
            let mut session = self.inner.session.lock().await;
            session.cancel.cancel();
            for task in session.tasks.drain(..) {
                task.abort();
            }
        }
        {
            let mut state = self.inner.state.lock().await;
            state.active = None;
            state.streaming = false;
            state.pending_switch = None;
            for status in state.statuses.values_mut() {
                status.state = ConnectionState::Disconnected;
                status.error = None;
                status.latency_ms = None;
            }
        }
        for transport in &self.inner.candidates {
            transport.close().await;
        }
        info!("disconnected");
        self.inner.publish().await;
    }

    /// Opens one chat exchange over the active transport and returns the raw
    /// wire chunk stream for it. A transport-level failure mid-stream is
    /// delivered to the caller as a synthesized terminal error chunk, and
    /// failover runs in the background.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        request: ChatRequest,
    ) -> Result<mpsc::UnboundedReceiver<StreamingMessage>, ConnectionError> {
        let cancel = self.inner.session.lock().await.cancel.clone();

        let transport = {
            let state = self.inner.state.lock().await;
            let active = state.active.ok_or_else(|| classify("no available connections"))?;
            self.inner
                .transport_by_id(active)
                .ok_or_else(|| classify("no available connections"))?
        };
        let transport_id = transport.id();

        {
            let mut state = self.inner.state.lock().await;
            state.streaming = true;
            if let Some(status) = state.statuses.get_mut(&transport_id) {
                status.state = ConnectionState::Streaming;
                status.last_activity = Some(Utc::now());
            }
        }
        self.inner.publish().await;

        let mut events = transport.open_stream(request, cancel.child_token());
        let (tx, rx) = mpsc::unbounded_channel();
        let conversation = conversation_id.to_string();
        let forward = self.inner.clone();

        tokio::spawn(async move {
            let mut last_sequence: u64 = 0;
            let mut stream_id = format!("{conversation}-stream");

            while let Some(event) = events.recv().await {
                match event {
                    StreamEvent::Message(message) => {
                        last_sequence = message.sequence.max(last_sequence);
                        stream_id = message.id.clone();
                        let terminal = message.is_terminal();
                        let in_band_error = message.error.clone();
                        let _ = tx.send(message);
                        if terminal {
                            if let Some(raw) = in_band_error {
                                forward.handle_stream_failure(transport_id, &raw).await;
                            }
                            break;
                        }
                    }
                    StreamEvent::Failed(raw) => {
                        let error = classify(&raw);
                        let _ = tx.send(StreamingMessage::terminal_error(
                            &conversation,
                            &stream_id,
                            last_sequence + 1,
                            error.to_string(),
                        ));
                        forward.handle_stream_failure(transport_id, &raw).await;
                        break;
                    }
                    StreamEvent::Closed => break,
                }
            }

            forward.end_stream().await;
        });

        Ok(rx)
    }

    pub async fn current_status(&self) -> StatusSnapshot {
        self.inner.snapshot().await
    }

    /// Status of the active transport, if any.
    pub async fn active_status(&self) -> Option<ConnectionStatus> {
        let state = self.inner.state.lock().await;
        state
            .active
            .and_then(|id| state.statuses.get(&id).cloned())
    }

    /// Delivers the current snapshot immediately, then one per transition.
    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StatusSnapshot> {
        self.inner.broadcaster.subscribe()
    }
}

impl BrokerInner {
    fn transport_by_id(&self, id: TransportId) -> Option<Arc<dyn Transport>> {
        self.candidates.iter().find(|t| t.id() == id).cloned()
    }

    fn priority_of(&self, id: TransportId) -> usize {
        self.candidates
            .iter()
            .position(|t| t.id() == id)
            .unwrap_or(usize::MAX)
    }

    async fn track_task(&self, handle: JoinHandle<()>) {
        self.session.lock().await.tasks.push(handle);
    }

    /// Tears down the previous session and prepares a fresh one. An explicit
    /// reconnect lifts auth suppression and restarts every backoff schedule.
    async fn begin_session(&self) -> CancellationToken {
        let cancel = {
            let mut session = self.session.lock().await;
            session.cancel.cancel();
            for task in session.tasks.drain(..) {
                task.abort();
            }
            session.cancel = CancellationToken::new();
            session.cancel.clone()
        };

        let mut state = self.state.lock().await;
        state.auth_suppressed.clear();
        state.active = None;
        state.streaming = false;
        state.pending_switch = None;
        for retry in state.retries.values_mut() {
            retry.reset();
        }
        for status in state.statuses.values_mut() {
            status.state = ConnectionState::Connecting;
            status.error = None;
            status.reconnect_attempts = 0;
        }
        cancel
    }

    async fn snapshot(&self) -> StatusSnapshot {
        let state = self.state.lock().await;
        let transports: Vec<ConnectionStatus> = self
            .candidates
            .iter()
            .filter_map(|t| state.statuses.get(&t.id()).cloned())
            .collect();
        let any_connected = transports.iter().any(|s| {
            matches!(
                s.state,
                ConnectionState::Connected | ConnectionState::Streaming
            )
        });
        StatusSnapshot {
            active: state.active,
            any_connected,
            transports,
        }
    }

    async fn publish(&self) {
        let snapshot = self.snapshot().await;
        self.broadcaster.publish(snapshot);
    }

    /// One candidate cycle. With `prefer_local` the local candidate is the
    /// sole first attempt; the remaining candidates are probed concurrently
    /// and the first success wins, cancelling the other in-flight probes.
    /// Returns whether a transport was activated.
    async fn run_cycle(
        &self,
        cancel: CancellationToken,
        ignore_backoff: bool,
        probing_state: ConnectionState,
        skip: Option<TransportId>,
    ) -> bool {
        let now = Instant::now();
        let mut eligible: Vec<Arc<dyn Transport>> = Vec::new();
        {
            let state = self.state.lock().await;
            for transport in &self.candidates {
                let id = transport.id();
                if Some(id) == skip || state.auth_suppressed.contains(&id) {
                    continue;
                }
                let Some(retry) = state.retries.get(&id) else {
                    continue;
                };
                if retry.has_reached_max_attempts() {
                    continue;
                }
                if !ignore_backoff && retry.is_backed_off(now) {
                    continue;
                }
                eligible.push(transport.clone());
            }
        }
        if eligible.is_empty() {
            return false;
        }

        if self.settings.prefer_local {
            if let Some(local) = eligible
                .iter()
                .find(|t| t.id() == TransportId::Local)
                .cloned()
            {
                self.set_probing(local.id(), probing_state).await;
                let probe = tokio::select! {
                    result = local.health_check() => Some(result),
                    _ = cancel.cancelled() => None,
                };
                match probe {
                    Some(Ok(latency)) => {
                        self.activate(local.id(), Some(latency)).await;
                        return true;
                    }
                    Some(Err(raw)) => {
                        self.record_failure(local.id(), &raw).await;
                    }
                    None => return false,
                }
                eligible.retain(|t| t.id() != TransportId::Local);
            }
        }
        if eligible.is_empty() {
            return false;
        }

        for transport in &eligible {
            self.set_probing(transport.id(), probing_state).await;
        }

        let probe_cancel = cancel.child_token();
        let mut probes: JoinSet<Option<(TransportId, Result<Duration, String>)>> = JoinSet::new();
        for transport in eligible {
            let token = probe_cancel.clone();
            probes.spawn(async move {
                tokio::select! {
                    result = transport.health_check() => Some((transport.id(), result)),
                    _ = token.cancelled() => None,
                }
            });
        }

        let mut winner: Option<(TransportId, Duration)> = None;
        while let Some(joined) = probes.join_next().await {
            let Ok(Some((id, result))) = joined else {
                continue;
            };
            match result {
                Ok(latency) => {
                    winner = Some((id, latency));
                    probe_cancel.cancel();
                    probes.abort_all();
                    break;
                }
                Err(raw) => {
                    self.record_failure(id, &raw).await;
                }
            }
        }

        match winner {
            Some((id, latency)) if !cancel.is_cancelled() => {
                self.activate(id, Some(latency)).await;
                true
            }
            _ => false,
        }
    }

    async fn set_probing(&self, id: TransportId, probing_state: ConnectionState) {
        let mut state = self.state.lock().await;
        if let Some(status) = state.statuses.get_mut(&id) {
            status.state = probing_state;
        }
        drop(state);
        self.publish().await;
    }

    async fn activate(&self, id: TransportId, latency: Option<Duration>) {
        {
            let mut state = self.state.lock().await;
            state.active = Some(id);
            state.pending_switch = None;
            if let Some(retry) = state.retries.get_mut(&id) {
                retry.reset();
            }
            for status in state.statuses.values_mut() {
                if status.transport == id {
                    status.state = ConnectionState::Connected;
                    status.last_activity = Some(Utc::now());
                    status.error = None;
                    status.reconnect_attempts = 0;
                    if let Some(latency) = latency {
                        status.latency_ms = Some(latency.as_millis() as u64);
                    }
                } else if matches!(
                    status.state,
                    ConnectionState::Connecting | ConnectionState::Reconnecting
                ) {
                    status.state = ConnectionState::Disconnected;
                }
            }
        }
        info!("activated transport {id}");
        self.publish().await;
    }

    /// Classifies and records a candidate failure. Authentication failures
    /// suppress automatic retry of the candidate for the rest of the session.
    async fn record_failure(&self, id: TransportId, raw: &str) {
        let error = classify(raw);
        let now = Instant::now();
        {
            let mut state = self.state.lock().await;
            if error.kind == ErrorKind::AuthenticationError || !error.retryable {
                state.auth_suppressed.insert(id);
            }
            let attempts = match state.retries.get_mut(&id) {
                Some(retry) => {
                    retry.record_failure(now);
                    retry.attempt_count()
                }
                None => 0,
            };
            if let Some(status) = state.statuses.get_mut(&id) {
                status.state = ConnectionState::Error;
                status.reconnect_attempts = attempts;
                status.error = Some(error.clone());
            }
            if state.active == Some(id) {
                state.active = None;
            }
        }
        warn!("transport {id} failed: {raw}");
        self.publish().await;
    }

    /// Active transport failed mid-session: record it, then immediately try
    /// the remaining candidates before falling back onto the backoff
    /// schedule. Authentication failures stop here; no automatic failover
    /// re-probes a suppressed candidate.
    async fn handle_stream_failure(self: &Arc<Self>, id: TransportId, raw: &str) {
        self.record_failure(id, raw).await;

        let cancel = self.session.lock().await.cancel.clone();
        if cancel.is_cancelled() {
            return;
        }

        let inner = self.clone();
        let handle = tokio::spawn(async move {
            let recovered = inner
                .run_cycle(cancel.clone(), true, ConnectionState::Reconnecting, Some(id))
                .await;
            if !recovered && !cancel.is_cancelled() {
                inner.retry_loop(cancel).await;
            }
        });
        self.track_task(handle).await;
    }

    /// Message boundary: the stream for the active exchange is done. Applies
    /// a pending pre-emption switch if the monitor found a healthier
    /// higher-priority candidate while the stream was in flight.
    async fn end_stream(&self) {
        let pending = {
            let mut state = self.state.lock().await;
            state.streaming = false;
            if let Some(active) = state.active {
                if let Some(status) = state.statuses.get_mut(&active) {
                    if status.state == ConnectionState::Streaming {
                        status.state = ConnectionState::Connected;
                    }
                    status.last_activity = Some(Utc::now());
                }
            }
            state.pending_switch.take()
        };

        match pending {
            Some(id) => {
                debug!("applying deferred switch to {id}");
                self.activate(id, None).await;
            }
            None => self.publish().await,
        }
    }

    /// Sleeps until the soonest `next_attempt` among candidates, then runs a
    /// cycle over the eligible ones. Ends when a transport activates or every
    /// candidate is suppressed or has reached max attempts.
    async fn retry_loop(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let wait_until = {
                let now = Instant::now();
                let state = self.state.lock().await;
                let mut soonest: Option<Instant> = None;
                for transport in &self.candidates {
                    let id = transport.id();
                    if state.auth_suppressed.contains(&id) {
                        continue;
                    }
                    let Some(retry) = state.retries.get(&id) else {
                        continue;
                    };
                    if retry.has_reached_max_attempts() {
                        continue;
                    }
                    let at = retry.next_attempt().unwrap_or(now);
                    soonest = Some(match soonest {
                        Some(current) => current.min(at),
                        None => at,
                    });
                }
                match soonest {
                    Some(at) => at,
                    None => {
                        debug!("no retryable candidates left; waiting for explicit reconnect");
                        return;
                    }
                }
            };

            tokio::select! {
                _ = sleep_until(wait_until) => {}
                _ = cancel.cancelled() => return,
            }

            if self
                .run_cycle(cancel.clone(), false, ConnectionState::Reconnecting, None)
                .await
            {
                return;
            }
        }
    }

    /// Periodic re-validation: re-probes higher-priority candidates that are
    /// not currently active. A healthy one pre-empts at the next message
    /// boundary, or immediately when no stream is in flight.
    async fn monitor_loop(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.settings.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => return,
            }
            self.revalidate().await;
        }
    }

    async fn revalidate(&self) {
        let (active, suppressed) = {
            let state = self.state.lock().await;
            (state.active, state.auth_suppressed.clone())
        };
        let Some(active_id) = active else {
            return;
        };
        let active_priority = self.priority_of(active_id);

        for transport in &self.candidates {
            let id = transport.id();
            if self.priority_of(id) >= active_priority {
                break;
            }
            if suppressed.contains(&id) {
                continue;
            }

            match transport.health_check().await {
                Ok(latency) => {
                    let streaming = {
                        let mut state = self.state.lock().await;
                        if let Some(status) = state.statuses.get_mut(&id) {
                            status.latency_ms = Some(latency.as_millis() as u64);
                        }
                        if state.streaming {
                            state.pending_switch = Some(id);
                        }
                        state.streaming
                    };
                    if streaming {
                        debug!("{id} healthy again; switching at the next message boundary");
                        self.publish().await;
                    } else {
                        self.activate(id, Some(latency)).await;
                    }
                    return;
                }
                Err(raw) => {
                    debug!("re-validation probe of {id} failed: {raw}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct MockTransport {
        id: TransportId,
        endpoint: String,
        health_script: StdMutex<VecDeque<Result<Duration, String>>>,
        default_health: Result<Duration, String>,
        health_calls: AtomicUsize,
        stream_script: StdMutex<Vec<StreamEvent>>,
        held_stream: StdMutex<Option<mpsc::UnboundedSender<StreamEvent>>>,
        hold_stream_open: bool,
    }

    impl MockTransport {
        fn healthy(id: TransportId) -> Arc<Self> {
            Arc::new(Self {
                id,
                endpoint: format!("mock://{id}"),
                health_script: StdMutex::new(VecDeque::new()),
                default_health: Ok(Duration::from_millis(5)),
                health_calls: AtomicUsize::new(0),
                stream_script: StdMutex::new(Vec::new()),
                held_stream: StdMutex::new(None),
                hold_stream_open: false,
            })
        }

        fn failing(id: TransportId, raw: &str) -> Arc<Self> {
            Arc::new(Self {
                id,
                endpoint: format!("mock://{id}"),
                health_script: StdMutex::new(VecDeque::new()),
                default_health: Err(raw.to_string()),
                health_calls: AtomicUsize::new(0),
                stream_script: StdMutex::new(Vec::new()),
                held_stream: StdMutex::new(None),
                hold_stream_open: false,
            })
        }

        fn script_health(&self, results: Vec<Result<Duration, String>>) {
            *self.health_script.lock().unwrap() = results.into();
        }

        fn script_stream(&self, events: Vec<StreamEvent>) {
            *self.stream_script.lock().unwrap() = events;
        }

        fn calls(&self) -> usize {
            self.health_calls.load(Ordering::SeqCst)
        }

        fn release_stream(&self) {
            self.held_stream.lock().unwrap().take();
        }
    }

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        fn id(&self) -> TransportId {
            self.id
        }

        fn endpoint(&self) -> &str {
            &self.endpoint
        }

        async fn health_check(&self) -> Result<Duration, String> {
            self.health_calls.fetch_add(1, Ordering::SeqCst);
            let scripted = self.health_script.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| self.default_health.clone())
        }

        fn open_stream(
            &self,
            _request: ChatRequest,
            _cancel: CancellationToken,
        ) -> mpsc::UnboundedReceiver<StreamEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            for event in self.stream_script.lock().unwrap().drain(..) {
                let _ = tx.send(event);
            }
            if self.hold_stream_open {
                *self.held_stream.lock().unwrap() = Some(tx);
            }
            rx
        }
    }

    fn wire_chunk(sequence: u64, chunk: &str, complete: bool) -> StreamingMessage {
        StreamingMessage {
            id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            chunk: chunk.to_string(),
            is_complete: complete,
            sequence,
            timestamp: Utc::now(),
            model: None,
            error: None,
        }
    }

    fn settings(prefer_local: bool, max_attempts: Option<u32>) -> BrokerSettings {
        BrokerSettings {
            prefer_local,
            health_check_interval: Duration::from_secs(30),
            retry_policy: RetryPolicy::new(
                Duration::from_secs(1),
                Duration::from_secs(300),
                max_attempts,
            ),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn activates_cloud_when_local_fails_without_waiting_on_backoff() {
        let local = MockTransport::failing(TransportId::Local, "Connection refused (os error 111)");
        let cloud = MockTransport::healthy(TransportId::CloudRelay);
        let broker = ConnectionBroker::new(
            vec![local.clone(), cloud.clone()],
            settings(false, None),
        );

        let snapshot = broker.connect().await;

        assert_eq!(snapshot.active, Some(TransportId::CloudRelay));
        assert!(snapshot.any_connected);
        let cloud_status = snapshot.status_of(TransportId::CloudRelay).unwrap();
        assert_eq!(cloud_status.state, ConnectionState::Connected);
        assert_eq!(cloud_status.latency_ms, Some(5));
        let local_status = snapshot.status_of(TransportId::Local).unwrap();
        assert_eq!(
            local_status.error.as_ref().unwrap().kind,
            ErrorKind::ServiceNotRunning
        );
    }

    #[tokio::test(start_paused = true)]
    async fn prefer_local_activates_local_without_probing_others() {
        let local = MockTransport::healthy(TransportId::Local);
        let cloud = MockTransport::healthy(TransportId::CloudRelay);
        let broker =
            ConnectionBroker::new(vec![local.clone(), cloud.clone()], settings(true, None));

        let snapshot = broker.connect().await;

        assert_eq!(snapshot.active, Some(TransportId::Local));
        assert_eq!(cloud.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn prefer_local_still_probes_local_before_falling_back() {
        let local = MockTransport::failing(TransportId::Local, "Connection refused");
        let cloud = MockTransport::healthy(TransportId::CloudRelay);
        let broker =
            ConnectionBroker::new(vec![local.clone(), cloud.clone()], settings(true, None));

        let snapshot = broker.connect().await;

        assert_eq!(local.calls(), 1);
        assert_eq!(snapshot.active, Some(TransportId::CloudRelay));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_candidates_terminate_at_max_attempts() {
        let local = MockTransport::failing(TransportId::Local, "Connection refused");
        let cloud = MockTransport::failing(TransportId::CloudRelay, "HTTP 503 Service Unavailable");
        let broker = ConnectionBroker::new(
            vec![local.clone(), cloud.clone()],
            settings(false, Some(2)),
        );

        let snapshot = broker.connect().await;
        assert_eq!(snapshot.active, None);

        // Let the retry loop run to exhaustion; paused time auto-advances.
        tokio::time::sleep(Duration::from_secs(600)).await;

        let snapshot = broker.current_status().await;
        assert!(!snapshot.any_connected);
        for id in [TransportId::Local, TransportId::CloudRelay] {
            let status = snapshot.status_of(id).unwrap();
            assert_eq!(status.state, ConnectionState::Error, "{id}");
            assert_eq!(status.reconnect_attempts, 2, "{id}");
        }
        assert_eq!(local.calls(), 2);
        assert_eq!(cloud.calls(), 2);

        // Terminal until explicit reconnect: no further probes, ever.
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(local.calls(), 2);
        assert_eq!(cloud.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_cycle_recovers_once_a_candidate_comes_back() {
        let local = MockTransport::failing(TransportId::Local, "Connection refused");
        local.script_health(vec![
            Err("Connection refused".to_string()),
            Ok(Duration::from_millis(3)),
        ]);
        let broker = ConnectionBroker::new(vec![local.clone()], settings(false, None));

        let snapshot = broker.connect().await;
        assert_eq!(snapshot.active, None);

        tokio::time::sleep(Duration::from_secs(5)).await;

        let snapshot = broker.current_status().await;
        assert_eq!(snapshot.active, Some(TransportId::Local));
        assert!(snapshot.any_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_chunks_are_forwarded_to_the_caller() {
        let local = MockTransport::healthy(TransportId::Local);
        local.script_stream(vec![
            StreamEvent::Message(wire_chunk(0, "He", false)),
            StreamEvent::Message(wire_chunk(1, "llo", false)),
            StreamEvent::Message(wire_chunk(2, "", true)),
        ]);
        let broker = ConnectionBroker::new(vec![local.clone()], settings(true, None));
        broker.connect().await;

        let mut rx = broker
            .send_message("c1", ChatRequest::new("llama3", Vec::new()))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().chunk, "He");
        assert_eq!(rx.recv().await.unwrap().chunk, "llo");
        let last = rx.recv().await.unwrap();
        assert!(last.is_terminal());
        assert!(rx.recv().await.is_none());

        tokio::time::sleep(Duration::from_millis(10)).await;
        let status = broker.active_status().await.unwrap();
        assert_eq!(status.state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn send_message_without_connection_is_an_error_value() {
        let local = MockTransport::failing(TransportId::Local, "Connection refused");
        let broker = ConnectionBroker::new(vec![local], settings(false, Some(1)));
        broker.connect().await;

        let result = broker
            .send_message("c1", ChatRequest::new("llama3", Vec::new()))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_suppresses_candidate_until_reconnect() {
        let local = MockTransport::healthy(TransportId::Local);
        local.script_stream(vec![StreamEvent::Failed("HTTP 401 Unauthorized".to_string())]);
        let broker = ConnectionBroker::new(vec![local.clone()], settings(true, None));
        broker.connect().await;
        assert_eq!(local.calls(), 1);

        let mut rx = broker
            .send_message("c1", ChatRequest::new("llama3", Vec::new()))
            .await
            .unwrap();
        let terminal = rx.recv().await.unwrap();
        assert!(terminal.error.is_some());

        // No automatic retry of the suppressed candidate, no matter how long
        // we wait.
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(local.calls(), 1);
        let snapshot = broker.current_status().await;
        assert_eq!(snapshot.active, None);
        assert_eq!(
            snapshot
                .status_of(TransportId::Local)
                .unwrap()
                .error
                .as_ref()
                .unwrap()
                .kind,
            ErrorKind::AuthenticationError
        );

        // An explicit reconnect lifts the suppression.
        let snapshot = broker.connect().await;
        assert_eq!(snapshot.active, Some(TransportId::Local));
        assert_eq!(local.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_mid_stream_fails_over_to_next_candidate() {
        let local = MockTransport::healthy(TransportId::Local);
        local.script_stream(vec![StreamEvent::Failed(
            "Connection refused (os error 111)".to_string(),
        )]);
        let cloud = MockTransport::healthy(TransportId::CloudRelay);
        let broker =
            ConnectionBroker::new(vec![local.clone(), cloud.clone()], settings(true, None));
        broker.connect().await;
        assert_eq!(broker.current_status().await.active, Some(TransportId::Local));

        let mut rx = broker
            .send_message("c1", ChatRequest::new("llama3", Vec::new()))
            .await
            .unwrap();
        let terminal = rx.recv().await.unwrap();
        assert!(terminal.is_terminal());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = broker.current_status().await;
        assert_eq!(snapshot.active, Some(TransportId::CloudRelay));
    }

    #[tokio::test(start_paused = true)]
    async fn revalidation_preempts_only_at_a_message_boundary() {
        let local = Arc::new(MockTransport {
            id: TransportId::Local,
            endpoint: "mock://local".to_string(),
            health_script: StdMutex::new(VecDeque::from([Err(
                "Connection refused".to_string()
            )])),
            default_health: Ok(Duration::from_millis(2)),
            health_calls: AtomicUsize::new(0),
            stream_script: StdMutex::new(Vec::new()),
            held_stream: StdMutex::new(None),
            hold_stream_open: false,
        });
        let cloud = Arc::new(MockTransport {
            id: TransportId::CloudRelay,
            endpoint: "mock://cloud".to_string(),
            health_script: StdMutex::new(VecDeque::new()),
            default_health: Ok(Duration::from_millis(40)),
            health_calls: AtomicUsize::new(0),
            stream_script: StdMutex::new(Vec::new()),
            held_stream: StdMutex::new(None),
            hold_stream_open: true,
        });

        let broker = ConnectionBroker::new(
            vec![local.clone(), cloud.clone()],
            BrokerSettings {
                prefer_local: true,
                health_check_interval: Duration::from_secs(5),
                retry_policy: RetryPolicy::default(),
            },
        );
        broker.connect().await;
        assert_eq!(
            broker.current_status().await.active,
            Some(TransportId::CloudRelay)
        );

        // Open a stream that stays in flight.
        let mut rx = broker
            .send_message("c1", ChatRequest::new("llama3", Vec::new()))
            .await
            .unwrap();

        // The monitor sees local healthy again, but must not switch while
        // the stream is open.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(
            broker.current_status().await.active,
            Some(TransportId::CloudRelay)
        );

        // Stream ends; the deferred switch applies at the boundary.
        cloud.release_stream();
        assert!(rx.recv().await.is_none());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            broker.current_status().await.active,
            Some(TransportId::Local)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_retries_and_clears_state() {
        let local = MockTransport::failing(TransportId::Local, "Connection refused");
        let broker = ConnectionBroker::new(vec![local.clone()], settings(false, None));
        broker.connect().await;
        let calls_after_connect = local.calls();

        broker.disconnect().await;

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(local.calls(), calls_after_connect);

        let snapshot = broker.current_status().await;
        assert_eq!(snapshot.active, None);
        assert!(!snapshot.any_connected);
        assert_eq!(
            snapshot.status_of(TransportId::Local).unwrap().state,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn subscriber_observes_transitions() {
        let local = MockTransport::healthy(TransportId::Local);
        let broker = ConnectionBroker::new(vec![local], settings(true, None));

        let mut rx = broker.subscribe();
        broker.connect().await;

        let mut saw_connected = false;
        while let Ok(snapshot) = rx.try_recv() {
            if snapshot.any_connected {
                saw_connected = true;
            }
        }
        assert!(saw_connected);
    }
}
