use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Connected,
    Disconnected,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Connected => "connected",
            ServiceStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One telemetry sample as reported by an in-process memory agent. Field
/// names follow the wire protocol, including the `MB` acronym casing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub service: String,
    #[serde(rename = "heapUsedMB")]
    pub heap_used_mb: f64,
    #[serde(rename = "heapTotalMB")]
    pub heap_total_mb: f64,
    #[serde(rename = "rssMB")]
    pub rss_mb: f64,
    #[serde(rename = "externalMB")]
    pub external_mb: f64,
    #[serde(rename = "eventLoopDelayMs")]
    pub event_loop_delay_ms: f64,
    pub timestamp: i64,
    #[serde(default, rename = "leakDetected")]
    pub leak_detected: bool,
    #[serde(default, rename = "memoryGrowthMB")]
    pub memory_growth_mb: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Leak,
    Snapshot,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Leak => "leak",
            AlertKind::Snapshot => "snapshot",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertSeverity {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "info" => Ok(AlertSeverity::Info),
            "warning" => Ok(AlertSeverity::Warning),
            "critical" => Ok(AlertSeverity::Critical),
            other => Err(format!("Unknown severity: {other}")),
        }
    }
}

/// A recorded event of interest, kept in the hub's bounded global ring.
/// Kind-specific fields are optional and omitted from frames when unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: u64,
    pub service: String,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: i64,
    #[serde(
        default,
        rename = "memoryGrowthMB",
        skip_serializing_if = "Option::is_none"
    )]
    pub memory_growth_mb: Option<f64>,
    #[serde(default, rename = "heapUsedMB", skip_serializing_if = "Option::is_none")]
    pub heap_used_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotPhase {
    Before,
    After,
}

impl SnapshotPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotPhase::Before => "before",
            SnapshotPhase::After => "after",
        }
    }
}

impl fmt::Display for SnapshotPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotPhase {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "before" => Ok(SnapshotPhase::Before),
            "after" => Ok(SnapshotPhase::After),
            other => Err(format!("Unknown snapshot phase: {other}")),
        }
    }
}

/// Declared attributes of a heap-snapshot capture, sent ahead of its chunks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotMeta {
    pub id: String,
    #[serde(rename = "serviceName")]
    pub service_name: String,
    #[serde(default, rename = "containerId")]
    pub container_id: String,
    pub phase: SnapshotPhase,
    pub timestamp: i64,
    pub size: u64,
    pub filename: String,
    #[serde(default, rename = "totalChunks", skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
}

/// What the dashboard sees for one service, both in the `initial` frame and
/// in `GET /api/services`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSummary {
    pub name: String,
    pub status: ServiceStatus,
    #[serde(rename = "registeredAt")]
    pub registered_at: i64,
    #[serde(rename = "lastSeen")]
    pub last_seen: i64,
    #[serde(rename = "totalAlerts")]
    pub total_alerts: u64,
    #[serde(default, rename = "lastMetrics", skip_serializing_if = "Option::is_none")]
    pub last_metrics: Option<MetricSample>,
}
