//! Mutable state carried through one run (or several, for the harness).

use serde::Serialize;
use tracing::info;

use crate::metrics::{percentile, ChunkMetrics, LatencySummary};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdaptivePolicy {
    /// p95 first-frame latency above this shrinks the chunk size.
    pub latency_threshold_ms: f64,
    /// Inspect latency after every this many chunks.
    pub adapt_every: usize,
    pub min_chars: usize,
    pub shrink_factor: f64,
}

impl Default for AdaptivePolicy {
    fn default() -> Self {
        Self {
            latency_threshold_ms: 600.0,
            adapt_every: 5,
            min_chars: 80,
            shrink_factor: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Adaptation {
    pub from: usize,
    pub to: usize,
    pub p95_ms: f64,
}

#[derive(Debug, Clone)]
pub struct RunContext {
    /// Chunk limit for the chunks not yet produced.
    pub max_chars: usize,
    /// Prebuffer for the next playback buffer; raised by underruns.
    pub prebuffer_ms: u32,
    policy: AdaptivePolicy,
    metrics: Vec<ChunkMetrics>,
    since_adapt: usize,
}

impl RunContext {
    pub fn new(max_chars: usize, prebuffer_ms: u32, policy: AdaptivePolicy) -> Self {
        Self {
            max_chars,
            prebuffer_ms,
            policy,
            metrics: Vec::new(),
            since_adapt: 0,
        }
    }

    pub fn policy(&self) -> &AdaptivePolicy {
        &self.policy
    }

    pub fn metrics(&self) -> &[ChunkMetrics] {
        &self.metrics
    }

    pub fn summary(&self) -> LatencySummary {
        LatencySummary::from_metrics(&self.metrics)
    }

    /// Append one chunk's record and, every `adapt_every` chunks, shrink
    /// `max_chars` when the recent p95 first-frame latency is over threshold.
    pub fn record(&mut self, metrics: ChunkMetrics) -> Option<Adaptation> {
        self.metrics.push(metrics);
        self.since_adapt += 1;
        if self.policy.adapt_every == 0 || self.since_adapt < self.policy.adapt_every {
            return None;
        }
        self.since_adapt = 0;

        // Cache hits say nothing about the backend.
        let window = &self.metrics[self.metrics.len() - self.policy.adapt_every..];
        let recent: Vec<f64> = window
            .iter()
            .filter(|m| !m.cache_hit)
            .map(ChunkMetrics::synthesis_latency_ms)
            .collect();
        if recent.is_empty() {
            return None;
        }

        let p95 = percentile(&recent, 0.95);
        if p95 <= self.policy.latency_threshold_ms {
            return None;
        }
        let shrunk = ((self.max_chars as f64 * self.policy.shrink_factor).floor() as usize)
            .max(self.policy.min_chars)
            .max(1);
        if shrunk >= self.max_chars {
            return None;
        }

        let adaptation = Adaptation {
            from: self.max_chars,
            to: shrunk,
            p95_ms: p95,
        };
        info!(from = adaptation.from, to = adaptation.to, p95_ms = p95, "shrinking chunk size");
        self.max_chars = shrunk;
        Some(adaptation)
    }
}
