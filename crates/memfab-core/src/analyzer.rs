use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("analyzer io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("analyzer failed: {0}")]
    Failed(String),
    #[error("analyzer produced an invalid report: {0}")]
    InvalidReport(String),
}

/// Pluggable before/after heap-snapshot analyzer. Implementations are handed
/// the two persisted blobs by path and must never be called while any hub
/// lock is held; the hub runs them on the blocking pool.
pub trait LeakAnalyzer: Send + Sync {
    fn name(&self) -> &'static str;

    fn analyze(
        &self,
        before: &Path,
        after: &Path,
        threshold_bytes: u64,
    ) -> Result<AnalysisReport, AnalyzerError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisReport {
    pub summary: AnalysisSummary,
    #[serde(default)]
    pub leaks: Vec<LeakFinding>,
    #[serde(default)]
    pub offenders: Vec<Offender>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisSummary {
    #[serde(default, rename = "totalLeaksMB")]
    pub total_leaks_mb: f64,
    #[serde(default, rename = "totalGrowthMB")]
    pub total_growth_mb: f64,
    #[serde(default, rename = "suspiciousGrowth")]
    pub suspicious_growth: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(
        default,
        rename = "beforeSizeBytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub before_size_bytes: Option<u64>,
    #[serde(
        default,
        rename = "afterSizeBytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub after_size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeakFinding {
    #[serde(rename = "objectType")]
    pub object_type: String,
    #[serde(default, rename = "countDelta")]
    pub count_delta: i64,
    #[serde(default, rename = "sizeDeltaMB")]
    pub size_delta_mb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Offender {
    pub name: String,
    #[serde(default, rename = "sizeMB")]
    pub size_mb: f64,
    #[serde(default)]
    pub count: u64,
}
