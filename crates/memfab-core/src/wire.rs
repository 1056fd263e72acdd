use crate::analyzer::AnalysisReport;
use crate::model::{Alert, MetricSample, ServiceStatus, ServiceSummary, SnapshotMeta};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Tags the hub dispatches on. A frame carrying any other tag is well formed
/// but unhandled; it is surfaced as [`DecodedFrame::Unknown`] so the caller
/// can log and drop it without replying.
const KNOWN_TAGS: &[&str] = &[
    "registration",
    "metrics",
    "snapshot",
    "capture-agent-registration",
    "snapshot-metadata",
    "snapshot-chunk",
    "snapshot-complete",
    "comparison-ready",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame is not valid JSON: {0}")]
    Malformed(String),
    #[error("frame has no type discriminator")]
    MissingTag,
    #[error("frame encode failed: {0}")]
    Encode(String),
}

/// Messages produced by agents (metrics producers and capture agents).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum AgentMsg {
    #[serde(rename = "registration")]
    Registration { service: String, timestamp: i64 },
    #[serde(rename = "metrics")]
    Metrics(MetricSample),
    #[serde(rename = "snapshot")]
    SnapshotNotice {
        service: String,
        filename: String,
        filepath: String,
        timestamp: i64,
    },
    #[serde(rename = "capture-agent-registration")]
    CaptureAgentRegistration {
        #[serde(rename = "serviceName")]
        service_name: String,
        #[serde(default, rename = "containerId")]
        container_id: String,
        timestamp: i64,
    },
    #[serde(rename = "snapshot-metadata")]
    SnapshotMetadata { snapshot: SnapshotMeta },
    #[serde(rename = "snapshot-chunk")]
    SnapshotChunk {
        #[serde(rename = "snapshotId")]
        snapshot_id: String,
        #[serde(rename = "chunkIndex")]
        chunk_index: u32,
        #[serde(rename = "totalChunks")]
        total_chunks: u32,
        data: String,
    },
    #[serde(rename = "snapshot-complete")]
    SnapshotComplete {
        #[serde(rename = "snapshotId")]
        snapshot_id: String,
    },
    #[serde(rename = "comparison-ready")]
    ComparisonReady(ComparisonRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonRequest {
    #[serde(rename = "serviceName")]
    pub service_name: String,
    #[serde(default, rename = "containerId")]
    pub container_id: String,
    #[serde(rename = "beforeSnapshotId")]
    pub before_snapshot_id: String,
    #[serde(rename = "afterSnapshotId")]
    pub after_snapshot_id: String,
    #[serde(default)]
    pub timeframe: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Msg(Box<AgentMsg>),
    Unknown { tag: String },
}

/// Decode one agent text frame. Three outcomes matter to the caller:
/// a dispatchable message, a well-formed frame with an unhandled tag
/// (dropped silently), or a protocol error (replied to inline).
pub fn decode_agent_frame(bytes: &[u8], max_frame_bytes: usize) -> Result<DecodedFrame, FrameError> {
    if bytes.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: bytes.len(),
            max: max_frame_bytes,
        });
    }
    let value: Value =
        serde_json::from_slice(bytes).map_err(|err| FrameError::Malformed(err.to_string()))?;
    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingTag)?;
    if !KNOWN_TAGS.contains(&tag) {
        return Ok(DecodedFrame::Unknown {
            tag: tag.to_string(),
        });
    }
    let msg: AgentMsg =
        serde_json::from_value(value).map_err(|err| FrameError::Malformed(err.to_string()))?;
    Ok(DecodedFrame::Msg(Box::new(msg)))
}

/// Events fanned out to dashboard subscribers. Serialized once per publish.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "initial")]
    Initial {
        services: Vec<ServiceSummary>,
        alerts: Vec<Alert>,
    },
    #[serde(rename = "serviceRegistered")]
    ServiceRegistered { service: String, timestamp: i64 },
    #[serde(rename = "serviceUpdate")]
    ServiceUpdate {
        service: String,
        status: ServiceStatus,
    },
    #[serde(rename = "metricsUpdate")]
    MetricsUpdate(MetricSample),
    #[serde(rename = "leakAlert")]
    LeakAlert(Alert),
    #[serde(rename = "snapshotAlert")]
    SnapshotAlert(Alert),
    #[serde(rename = "captureAgentRegistered")]
    CaptureAgentRegistered {
        service: String,
        #[serde(rename = "containerId")]
        container_id: String,
        timestamp: i64,
    },
    #[serde(rename = "snapshotStarted")]
    SnapshotStarted { snapshot: SnapshotMeta },
    #[serde(rename = "snapshotProgress")]
    SnapshotProgress {
        #[serde(rename = "snapshotId")]
        snapshot_id: String,
        #[serde(rename = "receivedChunks")]
        received_chunks: u32,
        #[serde(rename = "totalChunks")]
        total_chunks: u32,
    },
    #[serde(rename = "snapshotCompleted")]
    SnapshotCompleted {
        #[serde(rename = "snapshotId")]
        snapshot_id: String,
        filename: String,
        size: u64,
    },
    #[serde(rename = "comparisonStarted")]
    ComparisonStarted {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "serviceName")]
        service_name: String,
    },
    #[serde(rename = "comparisonCompleted")]
    ComparisonCompleted {
        #[serde(rename = "sessionId")]
        session_id: String,
        analysis: AnalysisReport,
    },
    #[serde(rename = "comparisonFailed")]
    ComparisonFailed {
        #[serde(rename = "sessionId")]
        session_id: String,
        error: String,
    },
    #[serde(rename = "comparisonPending")]
    ComparisonPending {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "missingSnapshots")]
        missing_snapshots: MissingSnapshots,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissingSnapshots {
    pub before: bool,
    pub after: bool,
}

pub fn encode_event(event: &Event) -> Result<String, FrameError> {
    serde_json::to_string(event).map_err(|err| FrameError::Encode(err.to_string()))
}

/// Inline reply for frames that fail discriminator validation. The
/// connection stays open.
pub fn protocol_error_frame() -> String {
    r#"{"error":"Invalid JSON message"}"#.to_string()
}
