use memfab_core::analyzer::{
    AnalysisReport, AnalysisSummary, AnalyzerError, LeakAnalyzer,
};
use std::path::Path;
use std::process::Command;
use tracing::debug;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Runs the configured external analyzer binary with
/// `<before> <after> <threshold-bytes>` and reads an [`AnalysisReport`] as
/// JSON from its stdout. The hub stays agnostic to how the blobs are
/// actually inspected.
pub struct CommandAnalyzer {
    command: String,
}

impl CommandAnalyzer {
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

impl LeakAnalyzer for CommandAnalyzer {
    fn name(&self) -> &'static str {
        "command"
    }

    fn analyze(
        &self,
        before: &Path,
        after: &Path,
        threshold_bytes: u64,
    ) -> Result<AnalysisReport, AnalyzerError> {
        debug!(event = "analyzer_exec", command = %self.command);
        let output = Command::new(&self.command)
            .arg(before)
            .arg(after)
            .arg(threshold_bytes.to_string())
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("analyzer exited with {}", output.status)
            } else {
                stderr
            };
            return Err(AnalyzerError::Failed(message));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|err| AnalyzerError::InvalidReport(err.to_string()))
    }
}

/// Fallback analyzer: compares on-disk blob sizes only. Deliberately blind
/// to snapshot internals, so it can never fail on a corrupt capture; its
/// confidence is reported accordingly low.
pub struct GrowthDeltaAnalyzer;

impl LeakAnalyzer for GrowthDeltaAnalyzer {
    fn name(&self) -> &'static str {
        "growth-delta"
    }

    fn analyze(
        &self,
        before: &Path,
        after: &Path,
        threshold_bytes: u64,
    ) -> Result<AnalysisReport, AnalyzerError> {
        let before_size = std::fs::metadata(before)?.len();
        let after_size = std::fs::metadata(after)?.len();
        let growth_bytes = after_size.saturating_sub(before_size);
        let total_growth_mb = growth_bytes as f64 / BYTES_PER_MB;
        let suspicious_growth = growth_bytes > threshold_bytes;

        let recommendations = if suspicious_growth {
            vec![format!(
                "Heap grew by {total_growth_mb:.1}MB between captures; re-run with a full analyzer to identify retainers"
            )]
        } else {
            Vec::new()
        };

        Ok(AnalysisReport {
            summary: AnalysisSummary {
                total_leaks_mb: 0.0,
                total_growth_mb,
                suspicious_growth,
                confidence: 0.3,
                before_size_bytes: Some(before_size),
                after_size_bytes: Some(after_size),
            },
            leaks: Vec::new(),
            offenders: Vec::new(),
            recommendations,
        })
    }
}
