//! Per-chunk latency records and their summary.
//!
//! Timestamps are milliseconds since the start of the run.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkMetrics {
    pub chunk_index: usize,
    pub char_len: usize,
    pub cache_hit: bool,
    pub attempts: u32,
    pub bytes: usize,
    pub request_start_ms: f64,
    pub first_frame_ms: f64,
    pub playback_start_ms: f64,
    pub chunk_complete_ms: f64,
}

impl ChunkMetrics {
    pub fn synthesis_latency_ms(&self) -> f64 {
        (self.first_frame_ms - self.request_start_ms).max(0.0)
    }

    pub fn startup_latency_ms(&self) -> f64 {
        (self.playback_start_ms - self.request_start_ms).max(0.0)
    }

    pub fn buffer_fill_latency_ms(&self) -> f64 {
        (self.playback_start_ms - self.first_frame_ms).max(0.0)
    }
}

/// Linear-interpolation percentile, `p` in `[0, 1]`.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let weight = rank - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct LatencySummary {
    pub chunks: usize,
    pub cache_hits: usize,
    pub p95_first_frame_ms: f64,
    pub p95_startup_ms: f64,
    pub avg_inter_chunk_gap_ms: f64,
}

impl LatencySummary {
    pub fn from_metrics(metrics: &[ChunkMetrics]) -> Self {
        if metrics.is_empty() {
            return Self::default();
        }
        let first: Vec<f64> = metrics.iter().map(ChunkMetrics::synthesis_latency_ms).collect();
        let startup: Vec<f64> = metrics.iter().map(ChunkMetrics::startup_latency_ms).collect();
        let gaps: Vec<f64> = metrics
            .windows(2)
            .map(|w| (w[1].playback_start_ms - w[0].chunk_complete_ms).max(0.0))
            .collect();
        let avg_gap = if gaps.is_empty() {
            0.0
        } else {
            gaps.iter().sum::<f64>() / gaps.len() as f64
        };

        Self {
            chunks: metrics.len(),
            cache_hits: metrics.iter().filter(|m| m.cache_hit).count(),
            p95_first_frame_ms: percentile(&first, 0.95),
            p95_startup_ms: percentile(&startup, 0.95),
            avg_inter_chunk_gap_ms: avg_gap,
        }
    }
}

/// A chunk record with its derived latencies, as written to reports.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkRecord {
    #[serde(flatten)]
    pub metrics: ChunkMetrics,
    pub synthesis_latency_ms: f64,
    pub startup_latency_ms: f64,
    pub buffer_fill_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub chunks: Vec<ChunkRecord>,
    pub summary: LatencySummary,
}

impl MetricsReport {
    pub fn new(metrics: &[ChunkMetrics]) -> Self {
        let chunks = metrics
            .iter()
            .map(|m| ChunkRecord {
                metrics: m.clone(),
                synthesis_latency_ms: m.synthesis_latency_ms(),
                startup_latency_ms: m.startup_latency_ms(),
                buffer_fill_latency_ms: m.buffer_fill_latency_ms(),
            })
            .collect();
        Self {
            chunks,
            summary: LatencySummary::from_metrics(metrics),
        }
    }
}
