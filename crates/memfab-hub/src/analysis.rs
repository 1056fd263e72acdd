use memfab_core::analyzer::AnalysisReport;
use memfab_core::model::{Alert, AlertKind, AlertSeverity};
use memfab_core::wire::{ComparisonRequest, Event, MissingSnapshots};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::hub::{now_ms, Hub};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Waiting,
    Analyzing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Analyzing => "analyzing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

/// Coordination record for one before/after analysis. Once a session
/// reaches a terminal status it is never mutated again.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonSession {
    #[serde(rename = "sessionId")]
    pub id: String,
    #[serde(rename = "serviceName")]
    pub service_name: String,
    #[serde(rename = "containerId")]
    pub container_id: String,
    #[serde(rename = "beforeSnapshotId")]
    pub before_snapshot_id: String,
    #[serde(rename = "afterSnapshotId")]
    pub after_snapshot_id: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionCounts {
    pub waiting: usize,
    pub analyzing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Owns every comparison session and guards the status transitions:
/// `waiting → analyzing → {completed, failed}`, each edge taken at most
/// once.
pub struct SessionRegistry {
    sessions: HashMap<String, ComparisonSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Reserve a fresh id for the request and insert the session in
    /// `waiting`. Ids derive from the wall clock; a same-millisecond
    /// collision nudges the suffix forward rather than touching the
    /// existing session.
    pub fn open(&mut self, req: &ComparisonRequest) -> ComparisonSession {
        let created_at = now_ms();
        let mut stamp = created_at;
        let mut id = format!("comparison_{}_{}", req.service_name, stamp);
        while self.sessions.contains_key(&id) {
            stamp += 1;
            id = format!("comparison_{}_{}", req.service_name, stamp);
        }
        let session = ComparisonSession {
            id: id.clone(),
            service_name: req.service_name.clone(),
            container_id: req.container_id.clone(),
            before_snapshot_id: req.before_snapshot_id.clone(),
            after_snapshot_id: req.after_snapshot_id.clone(),
            created_at,
            status: SessionStatus::Waiting,
            analysis: None,
            error: None,
        };
        self.sessions.insert(id, session.clone());
        session
    }

    /// `waiting → analyzing`; false if the session is gone or already left
    /// `waiting`.
    pub fn try_begin(&mut self, id: &str) -> bool {
        match self.sessions.get_mut(id) {
            Some(session) if session.status == SessionStatus::Waiting => {
                session.status = SessionStatus::Analyzing;
                true
            }
            _ => false,
        }
    }

    pub fn complete(&mut self, id: &str, report: AnalysisReport) {
        if let Some(session) = self.sessions.get_mut(id) {
            if session.status == SessionStatus::Analyzing {
                session.status = SessionStatus::Completed;
                session.analysis = Some(report);
            }
        }
    }

    pub fn fail(&mut self, id: &str, error: String) {
        if let Some(session) = self.sessions.get_mut(id) {
            if session.status == SessionStatus::Analyzing {
                session.status = SessionStatus::Failed;
                session.error = Some(error);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&ComparisonSession> {
        self.sessions.get(id)
    }

    pub fn list(&self) -> Vec<ComparisonSession> {
        let mut out: Vec<ComparisonSession> = self.sessions.values().cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        out
    }

    pub fn counts(&self) -> SessionCounts {
        let mut counts = SessionCounts::default();
        for session in self.sessions.values() {
            match session.status {
                SessionStatus::Waiting => counts.waiting += 1,
                SessionStatus::Analyzing => counts.analyzing += 1,
                SessionStatus::Completed => counts.completed += 1,
                SessionStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Scratch copies of both blobs handed to the analyzer. Lives in the OS
/// temp directory under predictable names; removed on every exit path.
struct ScratchPair {
    before: PathBuf,
    after: PathBuf,
}

impl ScratchPair {
    fn new(session_id: &str) -> Self {
        let dir = std::env::temp_dir();
        Self {
            before: dir.join(format!("memfab-{session_id}-before.heapsnapshot")),
            after: dir.join(format!("memfab-{session_id}-after.heapsnapshot")),
        }
    }

    async fn cleanup(&self) {
        let _ = tokio::fs::remove_file(&self.before).await;
        let _ = tokio::fs::remove_file(&self.after).await;
    }
}

impl Hub {
    /// Drive one comparison session from trigger to a settled state. Shared
    /// by the asynchronous `comparison-ready` path (spawned) and the
    /// synchronous compare endpoint (awaited); the returned session is the
    /// final record either way.
    pub async fn run_comparison(self: &Arc<Self>, req: ComparisonRequest) -> ComparisonSession {
        let session = self.sessions.write().await.open(&req);
        let session_id = session.id.clone();
        info!(
            event = "comparison_opened",
            session_id = %session_id,
            service = %req.service_name,
            before = %req.before_snapshot_id,
            after = %req.after_snapshot_id
        );

        let paths = {
            let snapshots = self.snapshots.read().await;
            (
                snapshots.blob_path(&req.before_snapshot_id),
                snapshots.blob_path(&req.after_snapshot_id),
            )
        };
        let (before_path, after_path) = match paths {
            (Some(before), Some(after)) => (before, after),
            (before, after) => {
                let missing = MissingSnapshots {
                    before: before.is_none(),
                    after: after.is_none(),
                };
                warn!(
                    event = "comparison_pending",
                    session_id = %session_id,
                    missing_before = missing.before,
                    missing_after = missing.after
                );
                self.publish(&Event::ComparisonPending {
                    session_id: session_id.clone(),
                    missing_snapshots: missing,
                })
                .await;
                return self.session_snapshot(&session_id).await.unwrap_or(session);
            }
        };

        if !self.sessions.write().await.try_begin(&session_id) {
            return self.session_snapshot(&session_id).await.unwrap_or(session);
        }
        self.publish(&Event::ComparisonStarted {
            session_id: session_id.clone(),
            service_name: req.service_name.clone(),
        })
        .await;

        let scratch = ScratchPair::new(&session_id);
        let staged = async {
            tokio::fs::copy(&before_path, &scratch.before).await?;
            tokio::fs::copy(&after_path, &scratch.after).await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        let outcome = match staged {
            Ok(()) => self.invoke_analyzers(&scratch.before, &scratch.after).await,
            Err(err) => Err(format!("failed to stage snapshots: {err}")),
        };
        scratch.cleanup().await;

        match outcome {
            Ok(report) => {
                self.sessions
                    .write()
                    .await
                    .complete(&session_id, report.clone());
                info!(
                    event = "comparison_completed",
                    session_id = %session_id,
                    growth_mb = report.summary.total_growth_mb,
                    suspicious = report.summary.suspicious_growth
                );
                self.publish(&Event::ComparisonCompleted {
                    session_id: session_id.clone(),
                    analysis: report.clone(),
                })
                .await;
                if report.summary.suspicious_growth {
                    self.raise_growth_alert(&req.service_name, &report).await;
                }
            }
            Err(error) => {
                self.sessions
                    .write()
                    .await
                    .fail(&session_id, error.clone());
                warn!(event = "comparison_failed", session_id = %session_id, error = %error);
                self.publish(&Event::ComparisonFailed {
                    session_id: session_id.clone(),
                    error,
                })
                .await;
            }
        }

        self.session_snapshot(&session_id).await.unwrap_or(session)
    }

    async fn session_snapshot(&self, id: &str) -> Option<ComparisonSession> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Primary analyzer, then a single fallback. Both run on the blocking
    /// pool with no hub lock held; their only inputs are the scratch paths.
    async fn invoke_analyzers(
        &self,
        before: &PathBuf,
        after: &PathBuf,
    ) -> Result<AnalysisReport, String> {
        let threshold_bytes = (self.config.leak_threshold_mb * 1024.0 * 1024.0) as u64;

        let primary = self.primary.clone();
        let primary_name = primary.name();
        let (before_p, after_p) = (before.clone(), after.clone());
        let primary_result = tokio::task::spawn_blocking(move || {
            primary.analyze(&before_p, &after_p, threshold_bytes)
        })
        .await;
        match primary_result {
            Ok(Ok(report)) => return Ok(report),
            Ok(Err(err)) => {
                warn!(event = "analyzer_failed", analyzer = primary_name, error = %err)
            }
            Err(err) => warn!(event = "analyzer_failed", analyzer = primary_name, error = %err),
        }

        let fallback = self.fallback.clone();
        let fallback_name = fallback.name();
        let (before_p, after_p) = (before.clone(), after.clone());
        let fallback_result = tokio::task::spawn_blocking(move || {
            fallback.analyze(&before_p, &after_p, threshold_bytes)
        })
        .await;
        match fallback_result {
            Ok(Ok(report)) => {
                info!(event = "analyzer_fallback_used", analyzer = fallback_name);
                Ok(report)
            }
            Ok(Err(err)) => Err(err.to_string()),
            Err(err) => Err(err.to_string()),
        }
    }

    async fn raise_growth_alert(&self, service: &str, report: &AnalysisReport) {
        let growth = report.summary.total_growth_mb;
        let severity = if growth > self.config.growth_alert_mb {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        let alert = self.store.write().await.record_alert(Alert {
            id: 0,
            service: service.to_string(),
            kind: AlertKind::Leak,
            severity,
            message: format!("Snapshot comparison found {growth:.1}MB suspicious growth in {service}"),
            timestamp: now_ms(),
            memory_growth_mb: Some(growth),
            heap_used_mb: None,
            filename: None,
            filepath: None,
        });
        self.publish(&Event::LeakAlert(alert)).await;
    }
}
