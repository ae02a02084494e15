// Metrics files written by `--metrics-json` and the latency harness

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tts_core::playback::PlaybackStats;
use tts_core::{ChunkMetrics, LatencySummary, MetricsReport, RunOutcome, RunReport};

use crate::error::CliError;

#[derive(Debug, Clone, Serialize)]
pub struct RunMetricsFile {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub backend: String,
    pub voice_id: String,
    pub outcome: RunOutcome,
    pub network_attempts: u32,
    pub bytes_submitted: usize,
    #[serde(flatten)]
    pub report: MetricsReport,
    pub playback: PlaybackStats,
}

impl RunMetricsFile {
    pub fn new(run_id: &str, backend: &str, voice_id: &str, run: &RunReport) -> Self {
        Self {
            run_id: run_id.to_string(),
            generated_at: Utc::now(),
            backend: backend.to_string(),
            voice_id: voice_id.to_string(),
            outcome: run.outcome,
            network_attempts: run.network_attempts,
            bytes_submitted: run.bytes_submitted,
            report: MetricsReport::new(&run.metrics),
            playback: run.playback.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub chunks: usize,
    pub cache_hits: usize,
    pub max_chars_after: usize,
    pub prebuffer_ms_after: u32,
    pub underruns: u32,
    pub summary: LatencySummary,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HarnessAggregate {
    pub runs: usize,
    pub total_chunks: usize,
    pub avg_first_frame_ms: f64,
    pub avg_startup_ms: f64,
    #[serde(flatten)]
    pub summary: LatencySummary,
}

impl HarnessAggregate {
    pub fn from_metrics(runs: usize, metrics: &[ChunkMetrics]) -> Self {
        let mean = |f: fn(&ChunkMetrics) -> f64| {
            if metrics.is_empty() {
                0.0
            } else {
                metrics.iter().map(f).sum::<f64>() / metrics.len() as f64
            }
        };
        Self {
            runs,
            total_chunks: metrics.len(),
            avg_first_frame_ms: mean(ChunkMetrics::synthesis_latency_ms),
            avg_startup_ms: mean(ChunkMetrics::startup_latency_ms),
            summary: LatencySummary::from_metrics(metrics),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HarnessReport {
    pub generated_at: DateTime<Utc>,
    pub iterations: usize,
    pub text_chars: usize,
    pub sample_rate: u32,
    pub aggregate: HarnessAggregate,
    pub runs: Vec<IterationRecord>,
}

/// Pretty JSON, parent directories created as needed.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CliError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| CliError::Other(anyhow::anyhow!("cannot serialize report: {e}")))?;
    std::fs::write(path, json)?;
    tracing::info!(path = %path.display(), "metrics written");
    Ok(())
}
