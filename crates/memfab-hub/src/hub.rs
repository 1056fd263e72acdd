use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderValue;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use memfab_core::analyzer::LeakAnalyzer;
use memfab_core::wire::{
    decode_agent_frame, encode_event, protocol_error_frame, AgentMsg, DecodedFrame, Event,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::analysis::SessionRegistry;
use crate::api;
use crate::publisher::Publisher;
use crate::reassembly::{PersistJob, SnapshotTable};
use crate::store::{ConnId, SessionStore};
use crate::Config;

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Process-wide hub state. Every long-lived record hangs off this struct;
/// nothing lives in module statics. Locks are held only across synchronous
/// sections; all IO and the analyzer run with no lock held.
pub struct Hub {
    pub config: Config,
    conn_counter: AtomicU64,
    started_at: Instant,
    pub store: RwLock<SessionStore>,
    pub snapshots: RwLock<SnapshotTable>,
    pub publisher: RwLock<Publisher>,
    pub sessions: RwLock<SessionRegistry>,
    pub(crate) primary: Arc<dyn LeakAnalyzer>,
    pub(crate) fallback: Arc<dyn LeakAnalyzer>,
}

impl Hub {
    pub fn new(
        config: Config,
        primary: Arc<dyn LeakAnalyzer>,
        fallback: Arc<dyn LeakAnalyzer>,
    ) -> Self {
        let store = SessionStore::new(config.metric_cap, config.alert_cap);
        let snapshots = SnapshotTable::new(config.snapshot_dir.clone(), config.max_frame_bytes);
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            started_at: Instant::now(),
            store: RwLock::new(store),
            snapshots: RwLock::new(snapshots),
            publisher: RwLock::new(Publisher::new()),
            sessions: RwLock::new(SessionRegistry::new()),
            primary,
            fallback,
        }
    }

    pub fn next_conn_id(&self) -> ConnId {
        self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Serialize once, deliver to every subscriber, drop the ones that
    /// cannot take the frame.
    pub async fn publish(&self, event: &Event) {
        let frame = match encode_event(event) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "event_encode_error", error = %err);
                return;
            }
        };
        let evicted = self.publisher.write().await.publish_frame(&frame);
        for conn in evicted {
            info!(event = "subscriber_evicted", conn_id = conn);
        }
    }

    pub async fn publish_all(&self, events: &[Event]) {
        for event in events {
            self.publish(event).await;
        }
    }

    /// Bootstrap frame for a fresh subscriber: connected services plus the
    /// most recent alerts.
    pub async fn initial_event(&self) -> Event {
        let store = self.store.read().await;
        Event::Initial {
            services: store.connected_services(),
            alerts: store.recent_alerts(self.config.initial_alerts),
        }
    }

    /// Periodic sweep marking services disconnected after the inactivity
    /// deadline, independent of socket closes.
    pub fn spawn_liveness_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.sweep_interval;
        let deadline = self.config.inactivity_timeout;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_ok() && *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let events = self
                            .store
                            .write()
                            .await
                            .sweep_inactive(deadline, Instant::now());
                        self.publish_all(&events).await;
                    }
                }
            }
        });
    }

    /// Agent side of the fabric: one read task per socket, frames dispatched
    /// in arrival order. Protocol errors are replied inline and never fatal.
    pub async fn handle_agent_socket(self: Arc<Self>, socket: WebSocket) {
        let conn_id = self.next_conn_id();
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(self.config.queue_capacity);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let send = ws_sender.send(msg);
                if tokio::time::timeout(write_timeout, send).await.is_err() {
                    return;
                }
            }
        });

        info!(event = "agent_connected", conn_id);

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "agent_read_error", conn_id, error = %err);
                    break;
                }
            };
            let data = match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => {
                    info!(event = "agent_close", conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            match decode_agent_frame(&data, self.config.max_frame_bytes) {
                Ok(DecodedFrame::Msg(msg)) => self.dispatch_agent_msg(conn_id, *msg).await,
                Ok(DecodedFrame::Unknown { tag }) => {
                    warn!(event = "unknown_message", conn_id, tag = %tag);
                }
                Err(err) => {
                    warn!(event = "protocol_error", conn_id, error = %err);
                    let _ = tx.send(Message::Text(protocol_error_frame())).await;
                }
            }
        }

        let events = self.store.write().await.reconcile_disconnect(conn_id);
        self.publish_all(&events).await;
        info!(event = "agent_disconnected", conn_id);
        drop(tx);
        let _ = write_task.await;
    }

    async fn dispatch_agent_msg(self: &Arc<Self>, conn_id: ConnId, msg: AgentMsg) {
        match msg {
            AgentMsg::Registration { service, timestamp } => {
                let events = self
                    .store
                    .write()
                    .await
                    .register_service(&service, timestamp, conn_id);
                self.publish_all(&events).await;
            }
            AgentMsg::Metrics(sample) => {
                let events = self
                    .store
                    .write()
                    .await
                    .ingest_metric(sample, Some(conn_id));
                self.publish_all(&events).await;
            }
            AgentMsg::SnapshotNotice {
                service,
                filename,
                filepath,
                timestamp,
            } => {
                let events = self.store.write().await.record_snapshot_notice(
                    &service, &filename, &filepath, timestamp,
                );
                self.publish_all(&events).await;
            }
            AgentMsg::CaptureAgentRegistration {
                service_name,
                container_id,
                timestamp,
            } => {
                let events = self.store.write().await.register_capture_agent(
                    &service_name,
                    &container_id,
                    timestamp,
                    conn_id,
                );
                self.publish_all(&events).await;
            }
            AgentMsg::SnapshotMetadata { snapshot } => {
                let event = self.snapshots.write().await.announce(snapshot);
                self.publish(&event).await;
            }
            AgentMsg::SnapshotChunk {
                snapshot_id,
                chunk_index,
                total_chunks,
                data,
            } => {
                let progress = self.snapshots.write().await.receive_chunk(
                    &snapshot_id,
                    chunk_index,
                    total_chunks,
                    data,
                );
                match progress {
                    Ok(progress) => {
                        self.publish(&Event::SnapshotProgress {
                            snapshot_id: snapshot_id.clone(),
                            received_chunks: progress.received,
                            total_chunks: progress.total,
                        })
                        .await;
                        if progress.ready {
                            self.finalize_snapshot(&snapshot_id).await;
                        }
                    }
                    Err(err) => {
                        warn!(event = "snapshot_chunk_dropped", snapshot_id = %snapshot_id, error = %err);
                    }
                }
            }
            AgentMsg::SnapshotComplete { snapshot_id } => {
                match self.snapshots.write().await.request_completion(&snapshot_id) {
                    Ok(true) => self.finalize_snapshot(&snapshot_id).await,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(event = "snapshot_complete_dropped", snapshot_id = %snapshot_id, error = %err);
                    }
                }
            }
            AgentMsg::ComparisonReady(req) => {
                let hub = self.clone();
                tokio::spawn(async move {
                    hub.run_comparison(req).await;
                });
            }
        }
    }

    /// Concatenate and persist a fully received snapshot, then announce
    /// completion. A failed write leaves the chunk table intact so the
    /// agent can retry the completion message.
    pub(crate) async fn finalize_snapshot(&self, id: &str) {
        let job = match self.snapshots.read().await.finalize_payload(id) {
            Ok(job) => job,
            Err(err) => {
                warn!(event = "snapshot_finalize_error", snapshot_id = id, error = %err);
                return;
            }
        };
        match self.persist_job(&job).await {
            Ok(event) => self.publish(&event).await,
            Err(err) => {
                warn!(event = "snapshot_persist_error", snapshot_id = id, error = %err);
            }
        }
    }

    /// Write one staged blob to its destination and flip the table entry to
    /// complete. IO happens with no lock held.
    pub(crate) async fn persist_job(&self, job: &PersistJob) -> std::io::Result<Event> {
        if let Some(parent) = job.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&job.path, job.payload.as_bytes()).await?;
        self.snapshots
            .write()
            .await
            .mark_persisted(&job.id, job.payload.len() as u64)
            .map_err(|err| std::io::Error::other(err.to_string()))
    }

    /// Dashboard side: deliver `initial`, join the fan-out set, keep the
    /// socket warm with pings, and leave the set on close. Subscribers
    /// never produce; inbound frames are ignored.
    pub async fn handle_dashboard_socket(self: Arc<Self>, socket: WebSocket) {
        let conn_id = self.next_conn_id();
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(self.config.queue_capacity);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let send = ws_sender.send(msg);
                if tokio::time::timeout(write_timeout, send).await.is_err() {
                    return;
                }
            }
        });

        let initial = self.initial_event().await;
        let frame = match encode_event(&initial) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "event_encode_error", error = %err);
                return;
            }
        };
        if !self
            .publisher
            .write()
            .await
            .subscribe(conn_id, tx.clone(), &frame)
        {
            drop(tx);
            let _ = write_task.await;
            return;
        }
        self.clone().spawn_subscriber_ping(conn_id, tx.clone());

        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(Message::Close(_)) => {
                    info!(event = "subscriber_close", conn_id);
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(other) => {
                    debug!(event = "subscriber_message_ignored", conn_id, frame = ?other);
                }
                Err(err) => {
                    warn!(event = "subscriber_read_error", conn_id, error = %err);
                    break;
                }
            }
        }

        self.publisher.write().await.remove(conn_id);
        info!(event = "subscriber_disconnected", conn_id);
        drop(tx);
        let _ = write_task.await;
    }

    fn spawn_subscriber_ping(self: Arc<Self>, conn_id: ConnId, tx: mpsc::Sender<Message>) {
        if self.config.ping_interval.is_zero() {
            return;
        }
        let interval = self.config.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx.send(Message::Ping(Vec::new())).await.is_err() {
                    self.publisher.write().await.remove(conn_id);
                    return;
                }
            }
        });
    }
}

pub async fn agent_ws_handler(
    State(hub): State<Arc<Hub>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        hub.handle_agent_socket(socket).await;
    })
}

pub async fn dashboard_ws_handler(
    State(hub): State<Arc<Hub>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        hub.handle_dashboard_socket(socket).await;
    })
}

fn cors_layer(origin: &str) -> CorsLayer {
    if origin == "*" {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    match origin.parse::<HeaderValue>() {
        Ok(value) => CorsLayer::new()
            .allow_origin(value)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(_) => {
            warn!(event = "invalid_cors_origin", origin);
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    }
}

/// Full request surface: agent and dashboard WebSocket endpoints plus the
/// HTTP query routes, with a JSON 404 for everything else.
pub fn router(hub: Arc<Hub>) -> Router {
    let cors = cors_layer(&hub.config.dashboard_origin);
    Router::new()
        .route("/", get(agent_ws_handler))
        .route("/dashboard", get(dashboard_ws_handler))
        .route("/health", get(api::health))
        .route("/api/services", get(api::services))
        .route("/api/services/:name/metrics", get(api::service_metrics))
        .route("/api/alerts", get(api::alerts))
        .route("/api/stats", get(api::stats))
        .route("/api/snapshots", get(api::snapshots))
        .route("/api/snapshots/upload", post(api::upload_snapshot))
        .route("/api/snapshots/compare", post(api::compare_snapshots))
        .route("/api/snapshots/comparisons", get(api::comparisons))
        .route(
            "/api/snapshots/comparisons/:session_id",
            get(api::comparison),
        )
        .fallback(api::not_found)
        .layer(cors)
        .with_state(hub)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn launch(hub: Arc<Hub>) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let app = router(hub);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    async fn connect(addr: SocketAddr, path: &str) -> Client {
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}{path}"))
            .await
            .expect("connect");
        client
    }

    async fn send_json(client: &mut Client, value: Value) {
        client
            .send(WsMessage::Text(value.to_string()))
            .await
            .expect("send frame");
    }

    async fn read_json(client: &mut Client) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(3), client.next())
                .await
                .expect("read timeout")
                .expect("stream ended")
                .expect("read error");
            match msg {
                WsMessage::Text(text) => return serde_json::from_str(&text).expect("frame json"),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    async fn read_json_timeout(client: &mut Client, timeout: Duration) -> Option<Value> {
        loop {
            let msg = match tokio::time::timeout(timeout, client.next()).await {
                Ok(Some(Ok(msg))) => msg,
                _ => return None,
            };
            match msg {
                WsMessage::Text(text) => return serde_json::from_str(&text).ok(),
                _ => continue,
            }
        }
    }

    async fn wait_for_connected(hub: &Arc<Hub>, n: usize) {
        for _ in 0..100 {
            if hub.store.read().await.connected_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("service did not register in time");
    }

    async fn wait_for_subscriber_count(hub: &Arc<Hub>, n: usize) {
        for _ in 0..100 {
            if hub.publisher.read().await.count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("subscriber set did not settle in time");
    }

    fn metrics_frame(service: &str, heap_used: f64, leak: bool, growth: f64) -> Value {
        json!({
            "type": "metrics",
            "service": service,
            "heapUsedMB": heap_used,
            "heapTotalMB": 200,
            "rssMB": 300,
            "externalMB": 5,
            "eventLoopDelayMs": 2,
            "timestamp": 1_000_100,
            "leakDetected": leak,
            "memoryGrowthMB": growth,
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn registration_and_metric_reach_subscriber() {
        let (hub, _dir, _events) = hub_with_defaults().await;
        let addr = launch(hub.clone()).await;

        let mut agent = connect(addr, "/").await;
        send_json(
            &mut agent,
            json!({"type": "registration", "service": "svc-a", "timestamp": 1_000_000}),
        )
        .await;
        wait_for_connected(&hub, 1).await;

        let mut subscriber = connect(addr, "/dashboard").await;
        let initial = read_json(&mut subscriber).await;
        assert_eq!(initial["type"], "initial");
        assert!(initial["services"]
            .as_array()
            .expect("services array")
            .iter()
            .any(|service| service["name"] == "svc-a"));

        send_json(&mut agent, metrics_frame("svc-a", 120.0, false, 1.0)).await;
        let update = read_json(&mut subscriber).await;
        assert_eq!(update["type"], "metricsUpdate");
        assert_eq!(update["service"], "svc-a");
        assert_eq!(update["heapUsedMB"], 120.0);

        let (window, total) = hub
            .store
            .read()
            .await
            .metrics_window("svc-a", None, None, 10)
            .expect("service");
        assert_eq!(total, 1);
        assert_eq!(window.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn leak_metric_fans_out_metrics_update_then_critical_alert() {
        let (hub, _dir, _events) = hub_with_defaults().await;
        let addr = launch(hub.clone()).await;

        let mut agent = connect(addr, "/").await;
        send_json(
            &mut agent,
            json!({"type": "registration", "service": "svc-a", "timestamp": 1_000_000}),
        )
        .await;
        wait_for_connected(&hub, 1).await;
        let mut subscriber = connect(addr, "/dashboard").await;
        let _ = read_json(&mut subscriber).await;

        send_json(&mut agent, metrics_frame("svc-a", 800.0, true, 50.0)).await;
        let update = read_json(&mut subscriber).await;
        assert_eq!(update["type"], "metricsUpdate");
        let alert = read_json(&mut subscriber).await;
        assert_eq!(alert["type"], "leakAlert");
        assert_eq!(alert["severity"], "critical");
        assert_eq!(alert["service"], "svc-a");

        let store = hub.store.read().await;
        assert_eq!(
            store
                .alerts_filtered(None, Some(memfab_core::model::AlertSeverity::Critical), 10)
                .len(),
            1
        );
        assert_eq!(store.connected_services()[0].total_alerts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn chunked_snapshot_persists_in_index_order() {
        let (hub, dir, _events) = hub_with_defaults().await;
        let addr = launch(hub.clone()).await;

        let mut subscriber = connect(addr, "/dashboard").await;
        let _ = read_json(&mut subscriber).await;

        let mut agent = connect(addr, "/").await;
        send_json(
            &mut agent,
            json!({"type": "snapshot-metadata", "snapshot": {
                "id": "before_svc-a_1", "serviceName": "svc-a", "containerId": "c1",
                "phase": "before", "timestamp": 1, "size": 9,
                "filename": "b.heapsnapshot", "totalChunks": 3
            }}),
        )
        .await;
        assert_eq!(read_json(&mut subscriber).await["type"], "snapshotStarted");

        for (index, data) in [(0, "abc"), (2, "ghi"), (1, "def")] {
            send_json(
                &mut agent,
                json!({"type": "snapshot-chunk", "snapshotId": "before_svc-a_1",
                       "chunkIndex": index, "totalChunks": 3, "data": data}),
            )
            .await;
            let progress = read_json(&mut subscriber).await;
            assert_eq!(progress["type"], "snapshotProgress");
            assert_eq!(progress["totalChunks"], 3);
        }

        send_json(
            &mut agent,
            json!({"type": "snapshot-complete", "snapshotId": "before_svc-a_1"}),
        )
        .await;
        let completed = read_json(&mut subscriber).await;
        assert_eq!(completed["type"], "snapshotCompleted");
        assert_eq!(completed["filename"], "b.heapsnapshot");
        assert_eq!(completed["size"], 9);

        let stored = std::fs::read(
            dir.path()
                .join("dashboard-snapshots")
                .join("b.heapsnapshot"),
        )
        .expect("snapshot file");
        assert_eq!(stored, b"abcdefghi");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn comparison_before_capture_emits_single_pending() {
        let (hub, _dir, _events) = hub_with_defaults().await;
        stage_completed_snapshot(&hub, "before_svc-a_1", "before.heapsnapshot", b"abc").await;
        let addr = launch(hub.clone()).await;

        let mut subscriber = connect(addr, "/dashboard").await;
        let _ = read_json(&mut subscriber).await;

        let mut agent = connect(addr, "/").await;
        send_json(
            &mut agent,
            json!({"type": "comparison-ready", "serviceName": "svc-a", "containerId": "c1",
                   "beforeSnapshotId": "before_svc-a_1", "afterSnapshotId": "after_svc-a_2",
                   "timeframe": "5m", "timestamp": 12}),
        )
        .await;

        let pending = read_json(&mut subscriber).await;
        assert_eq!(pending["type"], "comparisonPending");
        assert_eq!(pending["missingSnapshots"]["before"], false);
        assert_eq!(pending["missingSnapshots"]["after"], true);

        let session_id = pending["sessionId"].as_str().expect("session id").to_string();
        let sessions = hub.sessions.read().await;
        assert_eq!(
            sessions.get(&session_id).expect("session").status,
            crate::analysis::SessionStatus::Waiting
        );
        drop(sessions);

        // Exactly one pending frame, and no analysis ever starts.
        assert!(read_json_timeout(&mut subscriber, Duration::from_millis(300))
            .await
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_service_is_reaped_exactly_once_by_the_sweeper() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            inactivity_timeout: Duration::from_millis(400),
            sweep_interval: Duration::from_millis(100),
            ..test_config(&dir)
        };
        let hub = Arc::new(Hub::new(
            config,
            Arc::new(crate::analyzers::GrowthDeltaAnalyzer),
            Arc::new(crate::analyzers::GrowthDeltaAnalyzer),
        ));
        let addr = launch(hub.clone()).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        hub.clone().spawn_liveness_sweeper(shutdown_rx);

        // Agent registers, then goes silent with its socket still open.
        let mut agent = connect(addr, "/").await;
        send_json(
            &mut agent,
            json!({"type": "registration", "service": "svc-b", "timestamp": 1_000_000}),
        )
        .await;
        wait_for_connected(&hub, 1).await;

        let mut subscriber = connect(addr, "/dashboard").await;
        let _ = read_json(&mut subscriber).await;

        let update = read_json(&mut subscriber).await;
        assert_eq!(update["type"], "serviceUpdate");
        assert_eq!(update["service"], "svc-b");
        assert_eq!(update["status"], "disconnected");
        assert!(hub.store.read().await.connected_services().is_empty());

        // Only one transition: subsequent sweeps stay quiet.
        assert!(read_json_timeout(&mut subscriber, Duration::from_millis(500))
            .await
            .is_none());
        let _ = shutdown_tx.send(true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn agent_close_reconciles_service_ownership() {
        let (hub, _dir, _events) = hub_with_defaults().await;
        let addr = launch(hub.clone()).await;

        let mut agent = connect(addr, "/").await;
        send_json(
            &mut agent,
            json!({"type": "registration", "service": "svc-a", "timestamp": 1_000_000}),
        )
        .await;
        wait_for_connected(&hub, 1).await;

        let mut subscriber = connect(addr, "/dashboard").await;
        let _ = read_json(&mut subscriber).await;

        agent.close(None).await.expect("close");
        let update = read_json(&mut subscriber).await;
        assert_eq!(update["type"], "serviceUpdate");
        assert_eq!(update["service"], "svc-a");
        assert_eq!(update["status"], "disconnected");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_frame_gets_error_reply_and_connection_survives() {
        let (hub, _dir, _events) = hub_with_defaults().await;
        let addr = launch(hub.clone()).await;

        let mut agent = connect(addr, "/").await;
        agent
            .send(WsMessage::Text("{not json".to_string()))
            .await
            .expect("send");
        let reply = read_json(&mut agent).await;
        assert_eq!(reply["error"], "Invalid JSON message");

        // Unknown tags are dropped without a reply, and the connection is
        // still good for real traffic afterwards.
        send_json(&mut agent, json!({"type": "mystery", "service": "svc-a"})).await;
        send_json(
            &mut agent,
            json!({"type": "registration", "service": "svc-a", "timestamp": 1}),
        )
        .await;
        wait_for_connected(&hub, 1).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_subscriber_is_dropped_from_the_set() {
        let (hub, _dir, _events) = hub_with_defaults().await;
        let addr = launch(hub.clone()).await;

        let mut subscriber = connect(addr, "/dashboard").await;
        let _ = read_json(&mut subscriber).await;
        wait_for_subscriber_count(&hub, 2).await;

        subscriber.close(None).await.expect("close");
        wait_for_subscriber_count(&hub, 1).await;
    }
}
