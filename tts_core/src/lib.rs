//! Streaming text-to-speech core: chunking, phrase cache, synthesis sessions
//! with retry, the playback jitter buffer and the controller tying them
//! together. Concrete backends live in `tts_backend`.

pub mod cache;
pub mod chunker;
pub mod context;
pub mod controller;
#[cfg(feature = "device")]
pub mod device;
pub mod error;
pub mod events;
pub mod metrics;
pub mod playback;
pub mod retry;
pub mod session;
pub mod settings;
pub mod wav;

pub use cache::{key_for, CacheEntry, PhraseCache};
pub use chunker::{Chunk, Chunker};
pub use context::{AdaptivePolicy, RunContext};
pub use controller::{ControllerOptions, RunOutcome, RunReport, StreamingController};
pub use error::{FailureKind, Result, StreamError};
pub use events::{EventSink, PipelineEvent, RecordingEventSink, TracingEventSink};
pub use metrics::{ChunkMetrics, LatencySummary, MetricsReport};
pub use playback::{AudioSink, MemorySink, NullSink, PlaybackBuffer, PlaybackOptions};
pub use retry::RetryPolicy;
pub use session::{Backend, BackendMessage, Connection, SynthesisRequest, SynthesisSession};
pub use settings::{AudioFrame, SynthesisSettings};
pub use wav::WavCapture;

// Backends and the binary share these so versions never drift.
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
