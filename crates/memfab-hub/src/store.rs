use memfab_core::model::{
    Alert, AlertKind, AlertSeverity, MetricSample, ServiceStatus, ServiceSummary,
};
use memfab_core::wire::Event;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::info;

/// Non-owning handle to a producer connection. Connections are owned by
/// their socket task; the store only remembers which one currently speaks
/// for a service.
pub type ConnId = u64;

#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub name: String,
    pub registered_at: i64,
    pub last_seen_ms: i64,
    pub last_seen: Instant,
    pub status: ServiceStatus,
    pub total_alerts: u64,
    pub conn: Option<ConnId>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AlertCounts {
    pub info: usize,
    pub warning: usize,
    pub critical: usize,
}

/// Canonical in-memory state: service records, per-service metric rings and
/// the global alert ring. All methods are synchronous; callers hold the hub
/// lock only across these calls and publish the returned events afterwards.
pub struct SessionStore {
    metric_cap: usize,
    alert_cap: usize,
    services: HashMap<String, ServiceRecord>,
    metrics: HashMap<String, VecDeque<MetricSample>>,
    alerts: VecDeque<Alert>,
    next_alert_id: u64,
}

impl SessionStore {
    pub fn new(metric_cap: usize, alert_cap: usize) -> Self {
        Self {
            metric_cap,
            alert_cap,
            services: HashMap::new(),
            metrics: HashMap::new(),
            alerts: VecDeque::new(),
            next_alert_id: 0,
        }
    }

    /// Register (or re-register) a service. A new registration supersedes
    /// the previous producer connection in place; the record itself is
    /// never destroyed.
    pub fn register_service(&mut self, name: &str, timestamp: i64, conn: ConnId) -> Vec<Event> {
        let now = Instant::now();
        let record = self
            .services
            .entry(name.to_string())
            .or_insert_with(|| ServiceRecord {
                name: name.to_string(),
                registered_at: timestamp,
                last_seen_ms: timestamp,
                last_seen: now,
                status: ServiceStatus::Connected,
                total_alerts: 0,
                conn: None,
            });
        record.status = ServiceStatus::Connected;
        record.last_seen_ms = timestamp;
        record.last_seen = now;
        record.conn = Some(conn);
        info!(event = "service_registered", service = name, conn_id = conn);
        vec![Event::ServiceRegistered {
            service: name.to_string(),
            timestamp,
        }]
    }

    /// Register a capture agent under its `capture-<name>` pseudo-service.
    pub fn register_capture_agent(
        &mut self,
        service_name: &str,
        container_id: &str,
        timestamp: i64,
        conn: ConnId,
    ) -> Vec<Event> {
        let pseudo = format!("capture-{service_name}");
        let _ = self.register_service(&pseudo, timestamp, conn);
        vec![Event::CaptureAgentRegistered {
            service: pseudo,
            container_id: container_id.to_string(),
            timestamp,
        }]
    }

    /// Append a sample to the service's ring, refreshing liveness. A sample
    /// from a service the hub has never seen creates its record implicitly.
    pub fn ingest_metric(&mut self, sample: MetricSample, conn: Option<ConnId>) -> Vec<Event> {
        let now = Instant::now();
        let record = self
            .services
            .entry(sample.service.clone())
            .or_insert_with(|| ServiceRecord {
                name: sample.service.clone(),
                registered_at: sample.timestamp,
                last_seen_ms: sample.timestamp,
                last_seen: now,
                status: ServiceStatus::Connected,
                total_alerts: 0,
                conn: None,
            });
        record.status = ServiceStatus::Connected;
        record.last_seen_ms = sample.timestamp;
        record.last_seen = now;
        if conn.is_some() {
            record.conn = conn;
        }

        let ring = self.metrics.entry(sample.service.clone()).or_default();
        ring.push_back(sample.clone());
        while ring.len() > self.metric_cap {
            ring.pop_front();
        }

        let mut events = vec![Event::MetricsUpdate(sample.clone())];
        if sample.leak_detected {
            let alert = self.push_alert(Alert {
                id: 0,
                service: sample.service.clone(),
                kind: AlertKind::Leak,
                severity: AlertSeverity::Critical,
                message: format!(
                    "Memory leak detected in {}: {:.1}MB growth",
                    sample.service, sample.memory_growth_mb
                ),
                timestamp: sample.timestamp,
                memory_growth_mb: Some(sample.memory_growth_mb),
                heap_used_mb: Some(sample.heap_used_mb),
                filename: None,
                filepath: None,
            });
            if let Some(record) = self.services.get_mut(&sample.service) {
                record.total_alerts += 1;
            }
            events.push(Event::LeakAlert(alert));
        }
        events
    }

    /// Legacy notification from agents that write snapshots themselves.
    pub fn record_snapshot_notice(
        &mut self,
        service: &str,
        filename: &str,
        filepath: &str,
        timestamp: i64,
    ) -> Vec<Event> {
        let alert = self.push_alert(Alert {
            id: 0,
            service: service.to_string(),
            kind: AlertKind::Snapshot,
            severity: AlertSeverity::Info,
            message: format!("Heap snapshot captured: {filename}"),
            timestamp,
            memory_growth_mb: None,
            heap_used_mb: None,
            filename: Some(filename.to_string()),
            filepath: Some(filepath.to_string()),
        });
        if let Some(record) = self.services.get_mut(service) {
            record.total_alerts += 1;
        }
        vec![Event::SnapshotAlert(alert)]
    }

    /// Record an alert synthesized elsewhere (analysis coordinator). The id
    /// is assigned here.
    pub fn record_alert(&mut self, mut alert: Alert) -> Alert {
        if let Some(record) = self.services.get_mut(&alert.service) {
            record.total_alerts += 1;
        }
        alert = self.push_alert(alert);
        alert
    }

    fn push_alert(&mut self, mut alert: Alert) -> Alert {
        self.next_alert_id += 1;
        alert.id = self.next_alert_id;
        self.alerts.push_back(alert.clone());
        while self.alerts.len() > self.alert_cap {
            self.alerts.pop_front();
        }
        alert
    }

    /// A producer connection closed: every service it spoke for goes
    /// disconnected. Metrics and alerts are left untouched.
    pub fn reconcile_disconnect(&mut self, conn: ConnId) -> Vec<Event> {
        let mut events = Vec::new();
        for record in self.services.values_mut() {
            if record.conn == Some(conn) {
                record.conn = None;
                if record.status == ServiceStatus::Connected {
                    record.status = ServiceStatus::Disconnected;
                    info!(
                        event = "service_disconnected",
                        service = %record.name,
                        reason = "socket_closed"
                    );
                    events.push(Event::ServiceUpdate {
                        service: record.name.clone(),
                        status: ServiceStatus::Disconnected,
                    });
                }
            }
        }
        events
    }

    /// Liveness sweep: connected services not seen within `deadline` go
    /// disconnected even if their socket never closed.
    pub fn sweep_inactive(&mut self, deadline: Duration, now: Instant) -> Vec<Event> {
        let mut events = Vec::new();
        for record in self.services.values_mut() {
            if record.status == ServiceStatus::Connected
                && now.duration_since(record.last_seen) > deadline
            {
                record.status = ServiceStatus::Disconnected;
                record.conn = None;
                info!(
                    event = "service_disconnected",
                    service = %record.name,
                    reason = "inactivity"
                );
                events.push(Event::ServiceUpdate {
                    service: record.name.clone(),
                    status: ServiceStatus::Disconnected,
                });
            }
        }
        events
    }

    pub fn connected_services(&self) -> Vec<ServiceSummary> {
        let mut out: Vec<ServiceSummary> = self
            .services
            .values()
            .filter(|record| record.status == ServiceStatus::Connected)
            .map(|record| self.summarize(record))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    fn summarize(&self, record: &ServiceRecord) -> ServiceSummary {
        ServiceSummary {
            name: record.name.clone(),
            status: record.status,
            registered_at: record.registered_at,
            last_seen: record.last_seen_ms,
            total_alerts: record.total_alerts,
            last_metrics: self
                .metrics
                .get(&record.name)
                .and_then(|ring| ring.back().cloned()),
        }
    }

    /// Windowed metrics query. `None` means the service is unknown.
    pub fn metrics_window(
        &self,
        service: &str,
        from: Option<i64>,
        to: Option<i64>,
        limit: usize,
    ) -> Option<(Vec<MetricSample>, usize)> {
        if !self.services.contains_key(service) {
            return None;
        }
        let ring = self.metrics.get(service);
        let filtered: Vec<MetricSample> = ring
            .map(|ring| {
                ring.iter()
                    .filter(|sample| from.map_or(true, |from| sample.timestamp >= from))
                    .filter(|sample| to.map_or(true, |to| sample.timestamp <= to))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let total = filtered.len();
        // Most recent `limit` samples, still in arrival order.
        let skip = total.saturating_sub(limit);
        Some((filtered.into_iter().skip(skip).collect(), total))
    }

    /// Reverse-chronological alerts, optionally filtered.
    pub fn alerts_filtered(
        &self,
        service: Option<&str>,
        severity: Option<AlertSeverity>,
        limit: usize,
    ) -> Vec<Alert> {
        self.alerts
            .iter()
            .rev()
            .filter(|alert| service.map_or(true, |service| alert.service == service))
            .filter(|alert| severity.map_or(true, |severity| alert.severity == severity))
            .take(limit)
            .cloned()
            .collect()
    }

    /// The most recent `k` alerts for the subscriber bootstrap frame.
    pub fn recent_alerts(&self, k: usize) -> Vec<Alert> {
        self.alerts.iter().rev().take(k).cloned().collect()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn connected_count(&self) -> usize {
        self.services
            .values()
            .filter(|record| record.status == ServiceStatus::Connected)
            .count()
    }

    pub fn alert_count(&self) -> usize {
        self.alerts.len()
    }

    pub fn alert_counts(&self) -> AlertCounts {
        let mut counts = AlertCounts::default();
        for alert in &self.alerts {
            match alert.severity {
                AlertSeverity::Info => counts.info += 1,
                AlertSeverity::Warning => counts.warning += 1,
                AlertSeverity::Critical => counts.critical += 1,
            }
        }
        counts
    }

    #[cfg(test)]
    pub(crate) fn service(&self, name: &str) -> Option<&ServiceRecord> {
        self.services.get(name)
    }

    #[cfg(test)]
    pub(crate) fn backdate_last_seen(&mut self, name: &str, age: Duration) {
        if let Some(record) = self.services.get_mut(name) {
            record.last_seen = Instant::now() - age;
        }
    }
}
