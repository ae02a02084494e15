//! Discrete pipeline events and where they go.

use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::FailureKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    ChunkStart {
        chunk: usize,
        chars: usize,
        max_chars: usize,
    },
    CacheHit {
        chunk: usize,
        key: String,
        bytes: usize,
    },
    CacheMiss {
        chunk: usize,
        key: String,
    },
    FirstFrame {
        chunk: usize,
        attempt: u32,
        latency_ms: f64,
    },
    PlaybackStart {
        chunk: usize,
        latency_ms: f64,
        prebuffer_ms: u32,
    },
    ChunkComplete {
        chunk: usize,
        bytes: usize,
        frames: usize,
        attempts: u32,
        cached: bool,
        elapsed_ms: f64,
    },
    Retry {
        chunk: usize,
        attempt: u32,
        delay_ms: u64,
        kind: FailureKind,
        error: String,
        /// Audio of the retried attempt withheld because the failed attempt
        /// already played it.
        skipped_bytes: usize,
    },
    Error {
        chunk: Option<usize>,
        kind: FailureKind,
        error: String,
    },
    Interrupt {
        chunk: usize,
        delivered_bytes: usize,
    },
    Underrun {
        count: u32,
        prebuffer_ms: u32,
    },
    AdaptiveChunk {
        from: usize,
        to: usize,
        p95_ms: f64,
    },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::ChunkStart { .. } => "chunk_start",
            PipelineEvent::CacheHit { .. } => "cache_hit",
            PipelineEvent::CacheMiss { .. } => "cache_miss",
            PipelineEvent::FirstFrame { .. } => "first_frame",
            PipelineEvent::PlaybackStart { .. } => "playback_start",
            PipelineEvent::ChunkComplete { .. } => "chunk_complete",
            PipelineEvent::Retry { .. } => "retry",
            PipelineEvent::Error { .. } => "error",
            PipelineEvent::Interrupt { .. } => "interrupt",
            PipelineEvent::Underrun { .. } => "underrun",
            PipelineEvent::AdaptiveChunk { .. } => "adaptive_chunk",
        }
    }
}

/// Receiver of pipeline events. The core never formats output itself.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PipelineEvent);
}

/// One `tracing` record per event, fields rendered as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &PipelineEvent) {
        let name = event.name();
        let fields = serde_json::to_string(event).unwrap_or_default();
        match event {
            PipelineEvent::Error { .. } | PipelineEvent::Retry { .. } | PipelineEvent::Underrun { .. } => {
                warn!(event = name, fields = %fields, "pipeline event")
            }
            PipelineEvent::ChunkStart { .. }
            | PipelineEvent::ChunkComplete { .. }
            | PipelineEvent::Interrupt { .. }
            | PipelineEvent::AdaptiveChunk { .. } => info!(event = name, fields = %fields, "pipeline event"),
            _ => debug!(event = name, fields = %fields, "pipeline event"),
        }
    }
}

/// Keeps events in memory; used by tests and the latency harness.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(PipelineEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: &PipelineEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Fan out to several sinks.
impl<A: EventSink, B: EventSink> EventSink for (A, B) {
    fn emit(&self, event: &PipelineEvent) {
        self.0.emit(event);
        self.1.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_tag() {
        let event = PipelineEvent::Retry {
            chunk: 1,
            attempt: 1,
            delay_ms: 0,
            kind: FailureKind::NetworkTransient,
            error: "reset".into(),
            skipped_bytes: 640,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "retry");
        assert_eq!(json["kind"], "network_transient");
        assert_eq!(json["skipped_bytes"], 640);
        assert_eq!(event.name(), "retry");
    }

    #[test]
    fn test_recording_sink_counts() {
        let sink = RecordingEventSink::new();
        sink.emit(&PipelineEvent::CacheMiss { chunk: 0, key: "k".into() });
        sink.emit(&PipelineEvent::Interrupt { chunk: 0, delivered_bytes: 0 });
        sink.emit(&PipelineEvent::CacheMiss { chunk: 1, key: "k".into() });
        assert_eq!(sink.count("cache_miss"), 2);
        assert_eq!(sink.names(), vec!["cache_miss", "interrupt", "cache_miss"]);
        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_pair_fans_out() {
        let pair = (RecordingEventSink::new(), RecordingEventSink::new());
        pair.emit(&PipelineEvent::Underrun { count: 1, prebuffer_ms: 100 });
        assert_eq!(pair.0.count("underrun"), 1);
        assert_eq!(pair.1.count("underrun"), 1);
    }
}
