use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, sleep, timeout};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::classifier::{Classification, classify, parse_frame};
use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::normalizer::{build_patch, normalize_new};
use crate::store::{RecordStore, Upsert, UpsertOutcome};
use crate::subscribers::{Subscribers, SubscriptionId};
use crate::types::{ConnectionState, DisplayRecord};

/// Normal closure: the server is done with us, no reconnect.
pub const CLOSE_NORMAL: u16 = 1000;
/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Policy violation, used by the server for rejected credentials.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Local code recorded when the opening handshake exceeds its budget.
pub const CLOSE_HANDSHAKE_TIMEOUT: u16 = 4408;

/// How long a stopped session may take to send its close frame before it is aborted.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// What the pipeline did with one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    Inserted,
    Updated,
    Evicted,
    Control,
    ServerError,
    /// Dropped silently: unparsable, reserved id or no route.
    Ignored,
    /// Routed but failed normalization; the store was left unchanged.
    Rejected,
}

/// Running totals for the lifetime of a client.
#[derive(Debug, Default)]
struct Counters {
    frames: AtomicU64,
    new_records: AtomicU64,
    updates: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStats {
    pub frames_received: u64,
    pub new_records: u64,
    pub updates: u64,
    pub errors: u64,
}

struct Session {
    generation: u64,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    config: FeedConfig,
    store: Mutex<RecordStore>,
    subscribers: Subscribers,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    /// Bumped on every connect and disconnect; tasks from an older generation
    /// may not publish state or touch the store.
    generation: AtomicU64,
    attempts: AtomicU32,
    counters: Counters,
}

/// Handle to the feed connection manager.
///
/// Construct once at the application root and clone it into consumers. All
/// store mutations, subscriber notifications and reconnects go through it.
#[derive(Clone)]
pub struct FeedClient {
    inner: Arc<Inner>,
}

impl FeedClient {
    pub fn new(config: FeedConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                store: Mutex::new(RecordStore::new(config.max_records)),
                config,
                subscribers: Subscribers::default(),
                state,
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                attempts: AtomicU32::new(0),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Reconnect attempts made since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn on_new_record(
        &self,
        callback: impl Fn(&DisplayRecord) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.subscribers.on_new_record(callback)
    }

    pub fn on_update(
        &self,
        callback: impl Fn(&DisplayRecord) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.subscribers.on_update(callback)
    }

    pub fn on_error(&self, callback: impl Fn(&FeedError) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.subscribers.on_error(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.unsubscribe(id)
    }

    /// Current records, newest token first.
    pub fn snapshot(&self) -> Arc<[DisplayRecord]> {
        lock(&self.inner.store).snapshot()
    }

    pub fn stats(&self) -> FeedStats {
        let counters = &self.inner.counters;
        FeedStats {
            frames_received: counters.frames.load(Ordering::Relaxed),
            new_records: counters.new_records.load(Ordering::Relaxed),
            updates: counters.updates.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
        }
    }

    /// Re-derive ages and re-sort. Callable from any scheduler.
    pub fn refresh_ages(&self, now_epoch: i64) -> bool {
        lock(&self.inner.store).refresh_ages(now_epoch)
    }

    /// Run one raw text frame through classify → normalize → upsert → notify.
    pub fn process_frame(&self, text: &str) -> FrameDisposition {
        self.inner.process_frame(text)
    }

    /// Open the feed with `token`.
    ///
    /// Does nothing while a session is already connecting, connected or
    /// reconnecting. An empty token is reported to error subscribers and the
    /// client stays disconnected. Must be called from within a tokio runtime.
    pub fn connect(&self, token: &str) {
        let mut session = lock(&self.inner.session);
        if self.state().is_active() {
            debug!(state = %self.state(), "connect ignored, session already active");
            return;
        }

        let token = token.trim();
        if token.is_empty() {
            warn!("connect called without an auth token");
            self.inner
                .report_error(FeedError::Auth("missing auth token".to_string()));
            return;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.publish(generation, ConnectionState::Connecting);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let runner = tokio::spawn(run_session(
            self.inner.clone(),
            generation,
            token.to_string(),
            shutdown_rx.clone(),
        ));
        let ages = tokio::spawn(run_age_refresher(self.inner.clone(), generation, shutdown_rx));

        if let Some(previous) = session.replace(Session {
            generation,
            shutdown,
            tasks: vec![runner, ages],
        }) {
            previous.stop();
        }
    }

    /// Close the feed. Always legal; pending handshakes, pings, backoff timers
    /// and age refreshes are cancelled and can no longer revive the session.
    pub fn disconnect(&self, clear_records: bool) {
        if let Some(session) = self.detach(clear_records) {
            session.stop();
        }
    }

    /// Like [`disconnect`](Self::disconnect), but waits for the session to
    /// send its close frame before returning.
    pub async fn close(&self, clear_records: bool) {
        if let Some(session) = self.detach(clear_records) {
            session.join().await;
        }
    }

    fn detach(&self, clear_records: bool) -> Option<Session> {
        let mut session = lock(&self.inner.session);
        // Bump and publish under the watch lock so no stale publish lands in between.
        self.inner.state.send_modify(|state| {
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            *state = ConnectionState::Disconnected;
        });
        let previous = session.take();
        self.inner.attempts.store(0, Ordering::SeqCst);
        if clear_records {
            lock(&self.inner.store).clear();
        }
        info!(clear_records, "feed disconnected");
        previous
    }
}

impl Session {
    fn stop(self) {
        let _ = self.shutdown.send(true);
        match tokio::runtime::Handle::try_current() {
            // Give the session a moment to send its close frame before aborting.
            Ok(handle) => {
                let tasks = self.tasks;
                handle.spawn(async move {
                    sleep(CLOSE_GRACE).await;
                    for task in tasks {
                        task.abort();
                    }
                });
            }
            Err(_) => {
                for task in self.tasks {
                    task.abort();
                }
            }
        }
    }

    async fn join(self) {
        let _ = self.shutdown.send(true);
        for mut task in self.tasks {
            if timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn publish(&self, generation: u64, state: ConnectionState) {
        let published = self.state.send_if_modified(|current| {
            if !self.is_current(generation) || *current == state {
                return false;
            }
            *current = state;
            true
        });
        if published {
            debug!(%state, "connection state");
        }
    }

    fn reset_attempts(&self, generation: u64) {
        if self.is_current(generation) {
            self.attempts.store(0, Ordering::SeqCst);
        }
    }

    /// Drop the session entry once it settled on its own, stopping its age refresher.
    fn finish_session(&self, generation: u64) {
        let mut session = lock(&self.session);
        if session.as_ref().is_some_and(|s| s.generation == generation) {
            if let Some(finished) = session.take() {
                finished.stop();
            }
        }
    }

    fn report_error(&self, error: FeedError) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        self.subscribers.notify_error(&error);
    }

    fn process_frame(&self, text: &str) -> FrameDisposition {
        self.counters.frames.fetch_add(1, Ordering::Relaxed);

        let frame = match parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "dropping unparsable frame");
                return FrameDisposition::Ignored;
            }
        };

        let now = Utc::now();
        let outcome = {
            let mut store = lock(&self.store);
            let (id, input) = match classify(&frame, |id| store.contains(id)) {
                Classification::New { id } => match normalize_new(&frame, now) {
                    Ok(record) => (id, Upsert::Record(record)),
                    Err(e) => {
                        warn!(%id, error = %e, "failed to normalize new signal");
                        return FrameDisposition::Rejected;
                    }
                },
                Classification::Update { id } => match build_patch(&frame) {
                    Ok(patch) => (id, Upsert::Patch(patch)),
                    Err(e) => {
                        warn!(%id, error = %e, "failed to normalize update");
                        return FrameDisposition::Rejected;
                    }
                },
                Classification::ControlAck { message } => {
                    info!(message = message.as_deref().unwrap_or(""), "feed acknowledged");
                    return FrameDisposition::Control;
                }
                Classification::ServerError { message } => {
                    drop(store);
                    warn!(%message, "server reported an error");
                    self.report_error(FeedError::Server(message));
                    return FrameDisposition::ServerError;
                }
                Classification::Control => return FrameDisposition::Control,
                Classification::Dropped | Classification::Unroutable => {
                    debug!("dropping unroutable frame");
                    return FrameDisposition::Ignored;
                }
            };
            store.upsert(&id, input, now)
        };

        // Notify after releasing the store so callbacks may take snapshots.
        match outcome {
            UpsertOutcome::Inserted(record) => {
                self.counters.new_records.fetch_add(1, Ordering::Relaxed);
                self.subscribers.notify_new_record(&record);
                FrameDisposition::Inserted
            }
            UpsertOutcome::Merged(record) => {
                self.counters.updates.fetch_add(1, Ordering::Relaxed);
                self.subscribers.notify_update(&record);
                FrameDisposition::Updated
            }
            UpsertOutcome::Evicted => FrameDisposition::Evicted,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Delay before reconnect `attempt` (1-based): `base × 2^(attempt-1)`, capped.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let scaled = base.as_millis().saturating_mul(1u128 << exponent);
    Duration::from_millis(scaled.min(max.as_millis()) as u64)
}

/// Resolves once shutdown is requested or the session handle is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

enum ConnectionOutcome {
    Stop,
    Terminal(Option<FeedError>),
    Reconnect { opened: bool, code: u16 },
}

async fn run_session(
    inner: Arc<Inner>,
    generation: u64,
    token: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let config = &inner.config;
    loop {
        inner.publish(generation, ConnectionState::Connecting);

        match run_single_connection(&inner, generation, &token, &mut shutdown).await {
            ConnectionOutcome::Stop => return,
            ConnectionOutcome::Terminal(error) => {
                inner.publish(generation, ConnectionState::Disconnected);
                if let Some(error) = error {
                    if inner.is_current(generation) {
                        inner.report_error(error);
                    }
                }
                inner.finish_session(generation);
                return;
            }
            ConnectionOutcome::Reconnect { opened, code } => {
                if !inner.is_current(generation) {
                    return;
                }
                if opened {
                    inner.reset_attempts(generation);
                }
                let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt > config.max_reconnect_attempts {
                    warn!(
                        attempts = config.max_reconnect_attempts,
                        "giving up on feed connection"
                    );
                    inner.publish(generation, ConnectionState::Disconnected);
                    if inner.is_current(generation) {
                        inner.report_error(FeedError::Transport(format!(
                            "reconnect attempts exhausted after {} tries (last close code {code})",
                            config.max_reconnect_attempts
                        )));
                    }
                    inner.finish_session(generation);
                    return;
                }

                let delay = backoff_delay(
                    config.reconnect_base_delay(),
                    config.reconnect_max_delay(),
                    attempt,
                );
                warn!(
                    code,
                    attempt,
                    max_attempts = config.max_reconnect_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "feed connection lost, reconnecting"
                );
                inner.publish(generation, ConnectionState::Reconnecting { attempt });

                tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown) => return,
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}

async fn run_single_connection(
    inner: &Inner,
    generation: u64,
    token: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionOutcome {
    let config = &inner.config;
    let url = config.ws_url.as_str();

    let handshake = tokio::select! {
        _ = wait_for_shutdown(shutdown) => return ConnectionOutcome::Stop,
        result = timeout(config.handshake_timeout(), connect_async(url)) => result,
    };

    let mut stream = match handshake {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(tungstenite::Error::Http(response)))
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            warn!(ws_endpoint = %url, status = %response.status(), "feed rejected credentials");
            return ConnectionOutcome::Terminal(Some(FeedError::Auth(format!(
                "handshake rejected with HTTP {}",
                response.status()
            ))));
        }
        Ok(Err(e)) => {
            warn!(ws_endpoint = %url, error = %e, "failed to connect to feed");
            return ConnectionOutcome::Reconnect {
                opened: false,
                code: CLOSE_ABNORMAL,
            };
        }
        Err(_) => {
            warn!(
                ws_endpoint = %url,
                code = CLOSE_HANDSHAKE_TIMEOUT,
                timeout_secs = config.handshake_timeout_secs,
                "feed handshake timed out"
            );
            return ConnectionOutcome::Reconnect {
                opened: false,
                code: CLOSE_HANDSHAKE_TIMEOUT,
            };
        }
    };

    let auth = json!({ "authToken": token }).to_string();
    if let Err(e) = stream.send(Message::Text(auth.into())).await {
        warn!(error = %e, "failed to send auth frame");
        return ConnectionOutcome::Reconnect {
            opened: false,
            code: CLOSE_ABNORMAL,
        };
    }

    inner.reset_attempts(generation);
    inner.publish(generation, ConnectionState::Connected);
    info!(ws_endpoint = %url, "connected to feed");

    let mut ping = config.ping_interval().map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            _ = wait_for_shutdown(shutdown) => {
                let _ = stream.close(None).await;
                return ConnectionOutcome::Stop;
            }
            _ = next_tick(&mut ping) => {
                let frame = json!({ "type": "ping" }).to_string();
                if let Err(e) = stream.send(Message::Text(frame.into())).await {
                    warn!(error = %e, "failed to send keep-alive");
                    return ConnectionOutcome::Reconnect { opened: true, code: CLOSE_ABNORMAL };
                }
            }
            message = stream.next() => {
                if !inner.is_current(generation) {
                    let _ = stream.close(None).await;
                    return ConnectionOutcome::Stop;
                }
                match message {
                    Some(Ok(Message::Text(text))) => {
                        inner.process_frame(text.as_str());
                    }
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => {
                            inner.process_frame(text);
                        }
                        Err(_) => debug!(len = bytes.len(), "dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if stream.send(Message::Pong(payload)).await.is_err() {
                            return ConnectionOutcome::Reconnect { opened: true, code: CLOSE_ABNORMAL };
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                            .unwrap_or((1005, String::new()));
                        return close_outcome(code, &reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "feed stream error");
                        return ConnectionOutcome::Reconnect { opened: true, code: CLOSE_ABNORMAL };
                    }
                    None => {
                        return ConnectionOutcome::Reconnect { opened: true, code: CLOSE_ABNORMAL };
                    }
                }
            }
        }
    }
}

fn close_outcome(code: u16, reason: &str) -> ConnectionOutcome {
    match code {
        CLOSE_NORMAL => {
            info!(code, reason, "feed closed normally");
            ConnectionOutcome::Terminal(None)
        }
        CLOSE_POLICY_VIOLATION => {
            warn!(code, reason, "feed closed for policy violation");
            let message = if reason.is_empty() {
                "connection rejected by server".to_string()
            } else {
                reason.to_string()
            };
            ConnectionOutcome::Terminal(Some(FeedError::Auth(message)))
        }
        _ => {
            info!(code, reason, "feed closed");
            ConnectionOutcome::Reconnect { opened: true, code }
        }
    }
}

async fn run_age_refresher(
    inner: Arc<Inner>,
    generation: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(inner.config.age_refresh_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => return,
            _ = ticker.tick() => {
                if !inner.is_current(generation) {
                    return;
                }
                lock(&inner.store).refresh_ages(Utc::now().timestamp());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    fn test_config(url: &str) -> FeedConfig {
        FeedConfig {
            ws_url: url.to_string(),
            max_records: 8,
            handshake_timeout_secs: 1,
            ping_interval_secs: 0,
            reconnect_base_delay_ms: 200,
            reconnect_max_delay_ms: 1_000,
            max_reconnect_attempts: 5,
            age_refresh_interval_ms: 50,
        }
    }

    fn collect_errors(client: &FeedClient) -> Arc<Mutex<Vec<FeedError>>> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        client.on_error(move |e| lock(&sink).push(e.clone()));
        errors
    }

    async fn wait_for_state(client: &FeedClient, wanted: ConnectionState) {
        let mut rx = client.subscribe_state();
        timeout(Duration::from_secs(5), rx.wait_for(|state| *state == wanted))
            .await
            .expect("state should be reached in time")
            .expect("state channel open");
    }

    /// Record every state the client passes through.
    fn record_states(client: &FeedClient) -> Arc<Mutex<Vec<ConnectionState>>> {
        let seen = Arc::new(Mutex::new(vec![client.state()]));
        let sink = seen.clone();
        let mut rx = client.subscribe_state();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                lock(&sink).push(state);
            }
        });
        seen
    }

    async fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener address");
        (listener, format!("ws://127.0.0.1:{}", addr.port()))
    }

    fn signal(id: &str) -> String {
        json!({
            "token": id,
            "name": "Whale",
            "symbol": "WHL",
            "tokenCreatedAt": Utc::now().timestamp() - 60,
            "market": {"price": 2.0, "circulatingSupply": 100.0},
            "holdings": {"top10": 10.0},
            "trades": [{"signer": "w1", "amtSol": 3}]
        })
        .to_string()
    }

    // ── pipeline ───────────────────────────────────────────────────

    #[test]
    fn drop_silently_frames_leave_store_and_errors_untouched() {
        let client = FeedClient::new(test_config("ws://127.0.0.1:1"));
        let errors = collect_errors(&client);

        assert_eq!(client.process_frame(r#"{"token":"system"}"#), FrameDisposition::Ignored);
        assert_eq!(client.process_frame(r#"{"token":""}"#), FrameDisposition::Ignored);
        assert_eq!(client.process_frame("definitely not json"), FrameDisposition::Ignored);
        assert_eq!(client.process_frame("ping"), FrameDisposition::Control);

        assert!(client.snapshot().is_empty());
        assert!(lock(&errors).is_empty());
    }

    #[test]
    fn pipeline_notifies_new_then_update() {
        let client = FeedClient::new(test_config("ws://127.0.0.1:1"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        client.on_new_record(move |r| lock(&sink).push(format!("new:{}", r.id)));
        let sink = seen.clone();
        client.on_update(move |r| lock(&sink).push(format!("update:{}:{}", r.id, r.market_cap)));

        assert_eq!(client.process_frame(&signal("abc")), FrameDisposition::Inserted);
        let update = json!({"token": "abc", "market": {"price": 3.0}}).to_string();
        assert_eq!(client.process_frame(&update), FrameDisposition::Updated);

        assert_eq!(*lock(&seen), vec!["new:abc".to_string(), "update:abc:$300.00".to_string()]);
        assert_eq!(client.stats().new_records, 1);
        assert_eq!(client.stats().updates, 1);
        assert_eq!(client.stats().frames_received, 2);
    }

    #[test]
    fn redelivered_signal_does_not_duplicate() {
        let client = FeedClient::new(test_config("ws://127.0.0.1:1"));
        let frame = signal("abc");
        client.process_frame(&frame);
        let once: Value = serde_json::to_value(&*client.snapshot()).unwrap();
        client.process_frame(&frame);
        let twice: Value = serde_json::to_value(&*client.snapshot()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(client.snapshot().len(), 1);
    }

    #[test]
    fn malformed_update_is_rejected_without_mutation() {
        let client = FeedClient::new(test_config("ws://127.0.0.1:1"));
        let errors = collect_errors(&client);
        client.process_frame(&signal("abc"));
        let before: Value = serde_json::to_value(&*client.snapshot()).unwrap();

        let bad = json!({"token": "abc", "market": {"price": 5.0}, "trades": "oops"}).to_string();
        assert_eq!(client.process_frame(&bad), FrameDisposition::Rejected);
        assert_eq!(serde_json::to_value(&*client.snapshot()).unwrap(), before);
        assert!(lock(&errors).is_empty());
    }

    #[test]
    fn server_error_frames_reach_error_subscribers() {
        let client = FeedClient::new(test_config("ws://127.0.0.1:1"));
        let errors = collect_errors(&client);
        let frame = json!({"type": "error", "message": "subscription expired"}).to_string();
        assert_eq!(client.process_frame(&frame), FrameDisposition::ServerError);
        assert_eq!(*lock(&errors), vec![FeedError::Server("subscription expired".into())]);
    }

    #[test]
    fn store_bound_applies_through_pipeline() {
        let client = FeedClient::new(test_config("ws://127.0.0.1:1"));
        for i in 0..20 {
            client.process_frame(&signal(&format!("t{i}")));
            assert!(client.snapshot().len() <= 8);
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(5);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(base, max, 4), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(base, max, 5), Duration::from_secs(5));
        assert_eq!(backoff_delay(base, max, 60), Duration::from_secs(5));
    }

    #[test]
    fn close_codes_decide_reconnect() {
        assert!(matches!(close_outcome(1000, ""), ConnectionOutcome::Terminal(None)));
        assert!(matches!(
            close_outcome(1008, "bad token"),
            ConnectionOutcome::Terminal(Some(FeedError::Auth(_)))
        ));
        assert!(matches!(close_outcome(1006, ""), ConnectionOutcome::Reconnect { code: 1006, .. }));
        assert!(matches!(close_outcome(1011, ""), ConnectionOutcome::Reconnect { code: 1011, .. }));
    }

    // ── connection manager ─────────────────────────────────────────

    #[tokio::test]
    async fn empty_token_fails_fast() {
        let client = FeedClient::new(test_config("ws://127.0.0.1:1"));
        let errors = collect_errors(&client);
        client.connect("   ");
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(lock(&errors).as_slice(), [FeedError::Auth(_)]));
    }

    #[tokio::test]
    async fn reconnects_after_abnormal_close_and_resends_auth() {
        let (listener, url) = bind().await;
        let (auth_tx, mut auth_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            // First connection: read auth, then drop without a close frame (1006).
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                auth_tx.send(text.to_string()).unwrap();
            }
            drop(ws);

            // Second connection: read auth, push a signal, hold the socket open.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                auth_tx.send(text.to_string()).unwrap();
            }
            ws.send(Message::Text(signal("abc").into())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let client = FeedClient::new(test_config(&url));
        let states = record_states(&client);
        client.connect("tok");

        let expected = json!({"authToken": "tok"}).to_string();
        let first = timeout(Duration::from_secs(5), auth_rx.recv()).await.unwrap().unwrap();
        assert_eq!(first, expected);
        let second = timeout(Duration::from_secs(5), auth_rx.recv()).await.unwrap().unwrap();
        assert_eq!(second, expected);

        wait_for_state(&client, ConnectionState::Connected).await;
        timeout(Duration::from_secs(5), async {
            while client.snapshot().is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("signal should arrive on the second connection");

        assert_eq!(client.reconnect_attempts(), 0);
        let states = lock(&states).clone();
        let reconnecting = states
            .iter()
            .position(|s| *s == ConnectionState::Reconnecting { attempt: 1 })
            .expect("should pass through Reconnecting");
        assert!(
            states[reconnecting + 1..]
                .iter()
                .any(|s| matches!(s, ConnectionState::Connecting | ConnectionState::Connected))
        );

        client.disconnect(false);
    }

    #[tokio::test]
    async fn policy_violation_close_is_terminal() {
        let (listener, url) = bind().await;
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                conn_tx.send(()).unwrap();
                let mut ws = accept_async(stream).await.unwrap();
                let _ = ws.next().await;
                let _ = ws
                    .close(Some(CloseFrame {
                        code: CloseCode::Policy,
                        reason: "invalid token".into(),
                    }))
                    .await;
                while let Some(Ok(_)) = ws.next().await {}
            }
        });

        let client = FeedClient::new(test_config(&url));
        let errors = collect_errors(&client);
        client.connect("expired");

        timeout(Duration::from_secs(5), conn_rx.recv()).await.unwrap().unwrap();
        timeout(Duration::from_secs(5), async {
            while lock(&errors).is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("auth error should be surfaced");

        assert_eq!(*lock(&errors), vec![FeedError::Auth("invalid token".into())]);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        sleep(Duration::from_millis(500)).await;
        assert!(conn_rx.try_recv().is_err(), "no reconnect after policy close");
        assert!(lock(&client.inner.session).is_none(), "settled session releases its tasks");
    }

    #[tokio::test]
    async fn exhausted_attempts_surface_transport_error() {
        // Bind then drop to get a port nobody listens on.
        let (listener, url) = bind().await;
        drop(listener);

        let mut config = test_config(&url);
        config.reconnect_base_delay_ms = 10;
        config.max_reconnect_attempts = 2;
        let client = FeedClient::new(config);
        let errors = collect_errors(&client);
        client.connect("tok");

        timeout(Duration::from_secs(5), async {
            while lock(&errors).is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("exhaustion should be surfaced");

        assert!(matches!(lock(&errors).as_slice(), [FeedError::Transport(_)]));
        wait_for_state(&client, ConnectionState::Disconnected).await;
    }

    #[tokio::test]
    async fn handshake_timeout_triggers_reconnect() {
        let (listener, url) = bind().await;
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            let mut held: Vec<TcpStream> = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                conn_tx.send(()).unwrap();
                // Never answer the upgrade request.
                held.push(stream);
            }
        });

        let mut config = test_config(&url);
        config.reconnect_base_delay_ms = 10;
        config.max_reconnect_attempts = 1;
        let client = FeedClient::new(config);
        let errors = collect_errors(&client);
        client.connect("tok");

        timeout(Duration::from_secs(5), conn_rx.recv()).await.unwrap().unwrap();
        timeout(Duration::from_secs(5), conn_rx.recv()).await.unwrap().unwrap();
        wait_for_state(&client, ConnectionState::Disconnected).await;
        let errors = lock(&errors).clone();
        assert!(matches!(errors.as_slice(), [FeedError::Transport(msg)] if msg.contains("4408")));
    }

    #[tokio::test]
    async fn connect_is_noop_while_active_and_disconnect_is_final() {
        let (listener, url) = bind().await;
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<()>();
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                conn_tx.send(()).unwrap();
                let closed_tx = closed_tx.clone();
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    while let Some(Ok(message)) = ws.next().await {
                        if message.is_close() {
                            break;
                        }
                    }
                    let _ = closed_tx.send(());
                });
            }
        });

        let client = FeedClient::new(test_config(&url));
        client.connect("tok");
        wait_for_state(&client, ConnectionState::Connected).await;
        assert!(client.is_connected());

        client.connect("tok");
        client.process_frame(&signal("abc"));
        timeout(Duration::from_secs(5), conn_rx.recv()).await.unwrap().unwrap();

        client.disconnect(true);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.snapshot().is_empty());
        timeout(Duration::from_secs(5), closed_rx.recv())
            .await
            .expect("server should see the socket close")
            .unwrap();

        sleep(Duration::from_millis(500)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(conn_rx.try_recv().is_err(), "only one connection was opened");
    }

    /// Accepts WebSocket connections and holds them open until the client closes.
    async fn holding_server(listener: TcpListener, conn_tx: mpsc::UnboundedSender<()>) {
        while let Ok((stream, _)) = listener.accept().await {
            let _ = conn_tx.send(());
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_close() {
                        break;
                    }
                }
            });
        }
    }

    #[test]
    fn stale_generation_cannot_publish_or_reset_attempts() {
        let client = FeedClient::new(test_config("ws://127.0.0.1:1"));
        let inner = &client.inner;
        let stale = inner.generation.fetch_add(1, Ordering::SeqCst);
        inner.attempts.store(3, Ordering::SeqCst);

        inner.publish(stale, ConnectionState::Connected);
        inner.reset_attempts(stale);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.reconnect_attempts(), 3);

        let current = inner.generation.load(Ordering::SeqCst);
        inner.publish(current, ConnectionState::Connected);
        inner.reset_attempts(current);
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.reconnect_attempts(), 0);

        client.disconnect(false);
        inner.publish(current, ConnectionState::Connected);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_during_backoff_is_final() {
        let (listener, url) = bind().await;
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                conn_tx.send(()).unwrap();
                let mut ws = accept_async(stream).await.unwrap();
                let _ = ws.next().await;
                // Drop without a close frame.
            }
        });

        let mut config = test_config(&url);
        config.reconnect_base_delay_ms = 500;
        let client = FeedClient::new(config);
        let errors = collect_errors(&client);
        client.connect("tok");

        timeout(Duration::from_secs(5), conn_rx.recv()).await.unwrap().unwrap();
        let mut rx = client.subscribe_state();
        timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. })),
        )
        .await
        .expect("should enter backoff")
        .unwrap();

        client.disconnect(false);
        sleep(Duration::from_millis(1_000)).await;

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(conn_rx.try_recv().is_err(), "backoff timer must not reconnect");
        assert!(lock(&errors).is_empty());
    }

    #[tokio::test]
    async fn disconnect_during_handshake_is_final() {
        let (listener, url) = bind().await;
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            let mut held: Vec<TcpStream> = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                conn_tx.send(()).unwrap();
                held.push(stream);
            }
        });

        let mut config = test_config(&url);
        config.reconnect_base_delay_ms = 10;
        let client = FeedClient::new(config);
        let errors = collect_errors(&client);
        client.connect("tok");

        timeout(Duration::from_secs(5), conn_rx.recv()).await.unwrap().unwrap();
        assert_eq!(client.state(), ConnectionState::Connecting);
        client.disconnect(false);

        // Past the 1s handshake timeout and one backoff.
        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(conn_rx.try_recv().is_err(), "no further handshake attempts");
        assert!(lock(&errors).is_empty());
    }

    #[tokio::test]
    async fn sends_keep_alive_after_auth() {
        let (listener, url) = bind().await;
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    frame_tx.send(text.to_string()).unwrap();
                }
            }
        });

        let mut config = test_config(&url);
        config.ping_interval_secs = 1;
        let client = FeedClient::new(config);
        client.connect("tok");

        let first = timeout(Duration::from_secs(5), frame_rx.recv()).await.unwrap().unwrap();
        assert_eq!(first, json!({"authToken": "tok"}).to_string());
        let second = timeout(Duration::from_secs(5), frame_rx.recv()).await.unwrap().unwrap();
        assert_eq!(second, json!({"type": "ping"}).to_string());

        client.disconnect(false);
    }

    #[tokio::test]
    async fn answers_server_ping_with_pong() {
        let (listener, url) = bind().await;
        let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            ws.send(Message::Ping(vec![7u8, 8, 9].into())).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Pong(payload) = message {
                    pong_tx.send(payload.to_vec()).unwrap();
                    break;
                }
            }
        });

        let client = FeedClient::new(test_config(&url));
        client.connect("tok");

        let payload = timeout(Duration::from_secs(5), pong_rx.recv())
            .await
            .expect("server should receive a pong")
            .unwrap();
        assert_eq!(payload, vec![7u8, 8, 9]);

        client.disconnect(false);
    }

    #[tokio::test]
    async fn rejected_upgrade_is_terminal_auth_error() {
        let (listener, url) = bind().await;
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            while let Ok((mut stream, _)) = listener.accept().await {
                conn_tx.send(()).unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    )
                    .await;
                let _ = stream.shutdown().await;
            }
        });

        let client = FeedClient::new(test_config(&url));
        let errors = collect_errors(&client);
        client.connect("revoked");

        timeout(Duration::from_secs(5), conn_rx.recv()).await.unwrap().unwrap();
        wait_for_state(&client, ConnectionState::Disconnected).await;
        sleep(Duration::from_millis(500)).await;

        let errors = lock(&errors).clone();
        assert!(matches!(errors.as_slice(), [FeedError::Auth(msg)] if msg.contains("401")));
        assert!(conn_rx.try_recv().is_err(), "no reconnect after rejected upgrade");
    }

    #[tokio::test]
    async fn session_timer_refreshes_ages() {
        let (listener, url) = bind().await;
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<()>();
        tokio::spawn(holding_server(listener, conn_tx));

        let client = FeedClient::new(test_config(&url));
        client.connect("tok");
        timeout(Duration::from_secs(5), conn_rx.recv()).await.unwrap().unwrap();

        let frame = json!({
            "token": "abc",
            "name": "Whale",
            "symbol": "WHL",
            "tokenCreatedAt": Utc::now().timestamp() - 2,
        })
        .to_string();
        assert_eq!(client.process_frame(&frame), FrameDisposition::Inserted);
        let initial = client.snapshot()[0].token_age.clone();

        timeout(Duration::from_secs(5), async {
            while client.snapshot()[0].token_age == initial {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("age should be refreshed by the session timer");
        assert!(client.snapshot()[0].token_age.ends_with('s'));

        client.disconnect(false);
    }

    #[tokio::test]
    async fn close_waits_for_close_frame() {
        let (listener, url) = bind().await;
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<()>();
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            conn_tx.send(()).unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if message.is_close() {
                    closed_tx.send(()).unwrap();
                    break;
                }
            }
        });

        let client = FeedClient::new(test_config(&url));
        client.connect("tok");
        timeout(Duration::from_secs(5), conn_rx.recv()).await.unwrap().unwrap();
        wait_for_state(&client, ConnectionState::Connected).await;

        client.close(false).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        timeout(Duration::from_millis(500), closed_rx.recv())
            .await
            .expect("close frame should already be on the wire")
            .unwrap();
    }
}
