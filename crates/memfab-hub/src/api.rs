use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use memfab_core::model::{AlertSeverity, SnapshotMeta, SnapshotPhase};
use memfab_core::wire::ComparisonRequest;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use crate::hub::{now_ms, Hub};
use crate::reassembly::SnapshotInfo;

const DEFAULT_METRICS_LIMIT: usize = 100;
const DEFAULT_ALERTS_LIMIT: usize = 50;

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

pub async fn not_found() -> Response {
    json_error(StatusCode::NOT_FOUND, "Not found")
}

pub async fn health(State(hub): State<Arc<Hub>>) -> Response {
    let store = hub.store.read().await;
    Json(json!({
        "status": "ok",
        "timestamp": now_ms(),
        "services": store.connected_count(),
        "alerts": store.alert_count(),
        "uptimeSeconds": hub.uptime_seconds(),
    }))
    .into_response()
}

pub async fn services(State(hub): State<Arc<Hub>>) -> Response {
    Json(hub.store.read().await.connected_services()).into_response()
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub limit: Option<usize>,
    pub from: Option<i64>,
    pub to: Option<i64>,
}

pub async fn service_metrics(
    State(hub): State<Arc<Hub>>,
    Path(name): Path<String>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_METRICS_LIMIT);
    match hub
        .store
        .read()
        .await
        .metrics_window(&name, query.from, query.to, limit)
    {
        Some((metrics, total)) => Json(json!({
            "service": name,
            "metrics": metrics,
            "total": total,
        }))
        .into_response(),
        None => json_error(StatusCode::NOT_FOUND, "Service not found"),
    }
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    pub limit: Option<usize>,
    pub service: Option<String>,
    pub severity: Option<String>,
}

pub async fn alerts(State(hub): State<Arc<Hub>>, Query(query): Query<AlertsQuery>) -> Response {
    let severity = match query.severity.as_deref() {
        Some(raw) => match raw.parse::<AlertSeverity>() {
            Ok(severity) => Some(severity),
            Err(_) => return json_error(StatusCode::BAD_REQUEST, "Invalid severity"),
        },
        None => None,
    };
    let alerts = hub.store.read().await.alerts_filtered(
        query.service.as_deref(),
        severity,
        query.limit.unwrap_or(DEFAULT_ALERTS_LIMIT),
    );
    let total = alerts.len();
    Json(json!({ "alerts": alerts, "total": total })).into_response()
}

fn process_memory() -> Option<(u64, u64)> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = sysinfo::System::new();
    system.refresh_process(pid);
    let process = system.process(pid)?;
    Some((process.memory(), process.virtual_memory()))
}

pub async fn stats(State(hub): State<Arc<Hub>>) -> Response {
    let (service_total, connected, alert_total, by_severity) = {
        let store = hub.store.read().await;
        (
            store.service_count(),
            store.connected_count(),
            store.alert_count(),
            store.alert_counts(),
        )
    };
    let snapshot_count = hub.snapshots.read().await.snapshot_count();
    let comparison_counts = hub.sessions.read().await.counts();
    let subscriber_count = hub.publisher.read().await.count();
    let memory = process_memory()
        .map(|(rss, virt)| json!({ "rssBytes": rss, "virtualBytes": virt }))
        .unwrap_or(json!(null));

    Json(json!({
        "services": { "total": service_total, "connected": connected },
        "alerts": { "total": alert_total, "bySeverity": by_severity },
        "snapshots": snapshot_count,
        "comparisons": comparison_counts,
        "subscribers": subscriber_count,
        "memory": memory,
        "uptimeSeconds": hub.uptime_seconds(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    #[serde(rename = "serviceName")]
    pub service_name: Option<String>,
    #[serde(default, rename = "containerId")]
    pub container_id: Option<String>,
    pub phase: Option<String>,
    #[serde(rename = "snapshotData")]
    pub snapshot_data: Option<String>,
    pub filename: Option<String>,
}

/// Single-shot ingest: equivalent to announce + one chunk + complete, but
/// persisted under a per-service subdirectory.
pub async fn upload_snapshot(
    State(hub): State<Arc<Hub>>,
    Json(body): Json<UploadRequest>,
) -> Response {
    let (Some(service), Some(phase_raw), Some(data)) =
        (body.service_name, body.phase, body.snapshot_data)
    else {
        return json_error(StatusCode::BAD_REQUEST, "Missing required fields");
    };
    let Ok(phase) = phase_raw.parse::<SnapshotPhase>() else {
        return json_error(StatusCode::BAD_REQUEST, "Invalid phase");
    };
    if data.len() > hub.config.max_frame_bytes {
        return json_error(StatusCode::BAD_REQUEST, "Snapshot payload too large");
    }

    let id = format!("{}_{}_{}", phase.as_str(), service, now_ms());
    let filename = body.filename.unwrap_or_else(|| format!("{id}.heapsnapshot"));
    let meta = SnapshotMeta {
        id: id.clone(),
        service_name: service.clone(),
        container_id: body.container_id.unwrap_or_default(),
        phase,
        timestamp: now_ms(),
        size: data.len() as u64,
        filename: filename.clone(),
        total_chunks: Some(1),
    };
    let rel_path = PathBuf::from(&service).join(&filename);

    let (started, job) = hub.snapshots.write().await.stage_upload(meta, rel_path, data);
    hub.publish(&started).await;
    match hub.persist_job(&job).await {
        Ok(event) => {
            hub.publish(&event).await;
            Json(json!({
                "snapshotId": id,
                "serviceName": service,
                "phase": phase,
                "filename": filename,
                "size": job.payload.len(),
                "filepath": job.path.display().to_string(),
                "status": "complete",
            }))
            .into_response()
        }
        Err(err) => {
            warn!(event = "snapshot_upload_error", snapshot_id = %id, error = %err);
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist snapshot",
            )
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CompareBody {
    #[serde(rename = "serviceName")]
    pub service_name: Option<String>,
    #[serde(default, rename = "containerId")]
    pub container_id: Option<String>,
    #[serde(rename = "beforeSnapshotId")]
    pub before_snapshot_id: Option<String>,
    #[serde(rename = "afterSnapshotId")]
    pub after_snapshot_id: Option<String>,
}

/// Synchronous twin of the `comparison-ready` trigger: same session
/// machinery, result returned inline.
pub async fn compare_snapshots(
    State(hub): State<Arc<Hub>>,
    Json(body): Json<CompareBody>,
) -> Response {
    let (Some(service), Some(before), Some(after)) = (
        body.service_name,
        body.before_snapshot_id,
        body.after_snapshot_id,
    ) else {
        return json_error(StatusCode::BAD_REQUEST, "Missing required fields");
    };
    {
        let snapshots = hub.snapshots.read().await;
        if !snapshots.contains(&before) || !snapshots.contains(&after) {
            return json_error(StatusCode::NOT_FOUND, "Snapshot not found");
        }
    }
    let session = hub
        .run_comparison(ComparisonRequest {
            service_name: service,
            container_id: body.container_id.unwrap_or_default(),
            before_snapshot_id: before,
            after_snapshot_id: after,
            timeframe: None,
            timestamp: now_ms(),
        })
        .await;
    Json(session).into_response()
}

#[derive(Debug, Serialize)]
pub struct SessionGroup {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub snapshots: Vec<SnapshotInfo>,
    pub complete: bool,
}

/// Session identifier derived from the filename: extension stripped, then a
/// leading or trailing phase token removed.
fn session_key(filename: &str) -> String {
    let stem = filename
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(filename);
    for token in ["before", "after"] {
        for sep in ['-', '_'] {
            if let Some(rest) = stem.strip_prefix(&format!("{token}{sep}")) {
                return rest.to_string();
            }
            if let Some(rest) = stem.strip_suffix(&format!("{sep}{token}")) {
                return rest.to_string();
            }
        }
    }
    stem.to_string()
}

fn group_sessions(snapshots: &[SnapshotInfo]) -> Vec<SessionGroup> {
    let mut groups: BTreeMap<String, Vec<SnapshotInfo>> = BTreeMap::new();
    for snapshot in snapshots {
        groups
            .entry(session_key(&snapshot.filename))
            .or_default()
            .push(snapshot.clone());
    }
    groups
        .into_iter()
        .map(|(session_id, snapshots)| {
            let has_before = snapshots
                .iter()
                .any(|snapshot| snapshot.phase == SnapshotPhase::Before);
            let has_after = snapshots
                .iter()
                .any(|snapshot| snapshot.phase == SnapshotPhase::After);
            SessionGroup {
                session_id,
                snapshots,
                complete: has_before && has_after,
            }
        })
        .collect()
}

pub async fn snapshots(State(hub): State<Arc<Hub>>) -> Response {
    let list = hub.snapshots.read().await.list();
    let sessions = group_sessions(&list);
    let total = list.len();
    Json(json!({
        "snapshots": list,
        "sessions": sessions,
        "total": total,
    }))
    .into_response()
}

pub async fn comparisons(State(hub): State<Arc<Hub>>) -> Response {
    let sessions = hub.sessions.read().await.list();
    let total = sessions.len();
    Json(json!({ "comparisons": sessions, "total": total })).into_response()
}

pub async fn comparison(State(hub): State<Arc<Hub>>, Path(session_id): Path<String>) -> Response {
    match hub.sessions.read().await.get(&session_id) {
        Some(session) => Json(session.clone()).into_response(),
        None => json_error(StatusCode::NOT_FOUND, "Comparison session not found"),
    }
}
