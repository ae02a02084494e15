//! The orchestration loop: chunk, look up, synthesize, play, measure.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{key_for, PhraseCache};
use crate::chunker::{Chunk, Chunker};
use crate::context::RunContext;
use crate::error::{Result, StreamError};
use crate::events::{EventSink, PipelineEvent, TracingEventSink};
use crate::metrics::{ChunkMetrics, LatencySummary};
use crate::playback::{PlaybackBuffer, PlaybackStats, SubmitOutcome};
use crate::retry::{Attempt, RetryPolicy};
use crate::session::{Backend, SynthesisRequest, SynthesisSession};
use crate::settings::{bytes_for_ms, SynthesisSettings};

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerOptions {
    /// `false` sends the whole text as one chunk.
    pub chunking: bool,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Frame size used when replaying cached audio.
    pub replay_frame_ms: u32,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            chunking: true,
            timeout: Duration::from_millis(10_000),
            retry: RetryPolicy::default(),
            replay_frame_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Cancelled during or before chunk `chunk`.
    Interrupted { chunk: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub chunks: usize,
    pub cache_hits: usize,
    pub network_attempts: u32,
    pub bytes_submitted: usize,
    pub metrics: Vec<ChunkMetrics>,
    pub summary: LatencySummary,
    pub playback: PlaybackStats,
}

/// Per-run bookkeeping shared by the loop and the error path.
#[derive(Default)]
struct RunState {
    current_chunk: Option<usize>,
    metrics: Vec<ChunkMetrics>,
    network_attempts: u32,
    bytes_submitted: usize,
    underruns_seen: u32,
}

/// What happened to one chunk.
struct ChunkResult {
    request_start_ms: f64,
    first_frame_ms: Option<f64>,
    playback_start_ms: Option<f64>,
    bytes: usize,
    frames: usize,
    attempts: u32,
    cached: bool,
    interrupted: bool,
}

impl ChunkResult {
    fn new(request_start_ms: f64, cached: bool) -> Self {
        Self {
            request_start_ms,
            first_frame_ms: None,
            playback_start_ms: None,
            bytes: 0,
            frames: 0,
            attempts: if cached { 0 } else { 1 },
            cached,
            interrupted: false,
        }
    }
}

pub struct StreamingController {
    backend: Arc<dyn Backend>,
    settings: SynthesisSettings,
    options: ControllerOptions,
    cache: Option<PhraseCache>,
    events: Arc<dyn EventSink>,
}

impl StreamingController {
    pub fn new(backend: Arc<dyn Backend>, settings: SynthesisSettings, options: ControllerOptions) -> Self {
        Self {
            backend,
            settings,
            options,
            cache: None,
            events: Arc::new(TracingEventSink),
        }
    }

    pub fn with_cache(mut self, cache: PhraseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn settings(&self) -> &SynthesisSettings {
        &self.settings
    }

    /// Speak `text` through `playback`.
    ///
    /// Validation happens before any network activity. Whatever the outcome,
    /// playback is flushed and closed before this returns, and the raised
    /// prebuffer is carried back into `ctx` for the next run.
    pub async fn run(
        &self,
        text: &str,
        playback: &mut PlaybackBuffer,
        ctx: &mut RunContext,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let clock = Instant::now();
        let mut state = RunState::default();

        let result = self.drive(text, playback, ctx, cancel, clock, &mut state).await;

        let flushed = playback.flush_and_close().await;
        if let Ok(stats) = &flushed {
            ctx.prebuffer_ms = stats.prebuffer_ms;
        }

        match settle(result, flushed) {
            Ok((outcome, stats)) => {
                let cache_hits = state.metrics.iter().filter(|m| m.cache_hit).count();
                info!(
                    chunks = state.metrics.len(),
                    cache_hits,
                    outcome = ?outcome,
                    "run finished"
                );
                Ok(RunReport {
                    outcome,
                    chunks: state.metrics.len(),
                    cache_hits,
                    network_attempts: state.network_attempts,
                    bytes_submitted: state.bytes_submitted,
                    summary: LatencySummary::from_metrics(&state.metrics),
                    metrics: state.metrics,
                    playback: stats,
                })
            }
            Err(err) => {
                self.events.emit(&PipelineEvent::Error {
                    chunk: state.current_chunk,
                    kind: err.kind(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        text: &str,
        playback: &mut PlaybackBuffer,
        ctx: &mut RunContext,
        cancel: &CancellationToken,
        clock: Instant,
        state: &mut RunState,
    ) -> Result<RunOutcome> {
        self.settings.validate()?;
        if ctx.max_chars == 0 {
            return Err(StreamError::validation("max_chars must be positive"));
        }
        let mut chunker = Chunker::new(text)?;

        if let Some(cache) = &self.cache {
            let cache = cache.clone();
            // Detached: expired entries never hold up the first chunk.
            tokio::task::spawn_blocking(move || match cache.sweep(Utc::now()) {
                Ok(removed) if removed > 0 => debug!(removed, "swept expired cache entries"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "cache sweep failed"),
            });
        }

        playback.start(self.backend.sample_rate())?;

        loop {
            let chunk = if self.options.chunking {
                chunker.next_chunk(ctx.max_chars)?
            } else {
                chunker.rest()
            };
            let Some(chunk) = chunk else {
                return Ok(RunOutcome::Completed);
            };
            if cancel.is_cancelled() {
                self.events.emit(&PipelineEvent::Interrupt {
                    chunk: chunk.index,
                    delivered_bytes: 0,
                });
                return Ok(RunOutcome::Interrupted { chunk: chunk.index });
            }
            state.current_chunk = Some(chunk.index);

            self.events.emit(&PipelineEvent::ChunkStart {
                chunk: chunk.index,
                chars: chunk.char_len(),
                max_chars: ctx.max_chars,
            });
            let request_start_ms = elapsed_ms(clock);

            let key = key_for(&self.settings, &chunk.text);
            let cached = match &self.cache {
                Some(cache) => {
                    let cache = cache.clone();
                    let lookup_key = key.clone();
                    tokio::task::spawn_blocking(move || cache.lookup(&lookup_key))
                        .await
                        .ok()
                        .flatten()
                        .filter(|entry| entry.sample_rate == self.backend.sample_rate())
                }
                None => None,
            };

            let result = match cached {
                Some(entry) => {
                    self.events.emit(&PipelineEvent::CacheHit {
                        chunk: chunk.index,
                        key: key.clone(),
                        bytes: entry.pcm.len(),
                    });
                    let result = ChunkResult::new(request_start_ms, true);
                    self.replay(&chunk, &entry.pcm, playback, cancel, clock, state, result)
                        .await?
                }
                None => {
                    if self.cache.is_some() {
                        self.events.emit(&PipelineEvent::CacheMiss {
                            chunk: chunk.index,
                            key: key.clone(),
                        });
                    }
                    let result = ChunkResult::new(request_start_ms, false);
                    self.synthesize(&chunk, &key, playback, cancel, clock, state, result)
                        .await?
                }
            };

            let chunk_complete_ms = elapsed_ms(clock);
            let playback_start_ms = result.playback_start_ms.unwrap_or(chunk_complete_ms);
            let metrics = ChunkMetrics {
                chunk_index: chunk.index,
                char_len: chunk.char_len(),
                cache_hit: result.cached,
                attempts: result.attempts,
                bytes: result.bytes,
                request_start_ms,
                first_frame_ms: result.first_frame_ms.unwrap_or(chunk_complete_ms),
                playback_start_ms,
                chunk_complete_ms,
            };
            state.metrics.push(metrics.clone());
            if let Some(adaptation) = ctx.record(metrics) {
                self.events.emit(&PipelineEvent::AdaptiveChunk {
                    from: adaptation.from,
                    to: adaptation.to,
                    p95_ms: adaptation.p95_ms,
                });
            }

            if result.interrupted {
                self.events.emit(&PipelineEvent::Interrupt {
                    chunk: chunk.index,
                    delivered_bytes: result.bytes,
                });
                return Ok(RunOutcome::Interrupted { chunk: chunk.index });
            }
            self.events.emit(&PipelineEvent::ChunkComplete {
                chunk: chunk.index,
                bytes: result.bytes,
                frames: result.frames,
                attempts: result.attempts,
                cached: result.cached,
                elapsed_ms: chunk_complete_ms - request_start_ms,
            });
        }
    }

    /// Feed cached audio to playback in fixed-size frames.
    #[allow(clippy::too_many_arguments)]
    async fn replay(
        &self,
        chunk: &Chunk,
        pcm: &[u8],
        playback: &PlaybackBuffer,
        cancel: &CancellationToken,
        clock: Instant,
        state: &mut RunState,
        mut result: ChunkResult,
    ) -> Result<ChunkResult> {
        let frame_len = bytes_for_ms(self.options.replay_frame_ms, self.backend.sample_rate()).max(2);

        for frame in pcm.chunks(frame_len) {
            if cancel.is_cancelled() {
                result.interrupted = true;
                break;
            }
            if result.first_frame_ms.is_none() {
                result.first_frame_ms = Some(elapsed_ms(clock));
            }
            let outcome = playback.submit(frame).await?;
            self.after_submit(chunk, &outcome, playback, clock, state, &mut result, frame.len());
            result.frames += 1;
        }
        Ok(result)
    }

    /// Live synthesis under the retry policy. Frames go to playback as they
    /// arrive; after a retry, audio the failed attempt already played is
    /// skipped so nothing is heard twice.
    #[allow(clippy::too_many_arguments)]
    async fn synthesize(
        &self,
        chunk: &Chunk,
        key: &str,
        playback: &PlaybackBuffer,
        cancel: &CancellationToken,
        clock: Instant,
        state: &mut RunState,
        mut result: ChunkResult,
    ) -> Result<ChunkResult> {
        let request = SynthesisRequest {
            chunk_index: chunk.index,
            text: chunk.text.clone(),
            settings: self.settings.clone(),
            sample_rate: self.backend.sample_rate(),
        };
        let backend = Arc::clone(&self.backend);
        let timeout = self.options.timeout;
        let attempts = self
            .options
            .retry
            .execute(
                move |_attempt| SynthesisSession::new(Arc::clone(&backend), request.clone(), timeout),
                cancel.clone(),
            );
        futures::pin_mut!(attempts);
        state.network_attempts += 1;

        let mut current_attempt = 1;
        let mut attempt_pcm: Vec<u8> = Vec::new();
        let mut expected_seq: Option<u64> = None;
        let mut finalized = false;

        while let Some(item) = attempts.next().await {
            match item? {
                Attempt::Frame { attempt, frame } => {
                    if attempt != current_attempt {
                        current_attempt = attempt;
                        attempt_pcm.clear();
                        expected_seq = None;
                    }
                    if let Some(expected) = expected_seq {
                        if frame.sequence_no != expected {
                            return Err(StreamError::malformed(format!(
                                "sequence gap in chunk {}: expected frame {expected}, got {}",
                                chunk.index, frame.sequence_no
                            )));
                        }
                    }
                    expected_seq = match frame.sequence_no.checked_add(1) {
                        Some(next) => Some(next),
                        None if frame.is_final => None,
                        None => {
                            return Err(StreamError::malformed(format!(
                                "sequence number overflow in chunk {}",
                                chunk.index
                            )))
                        }
                    };

                    if result.first_frame_ms.is_none() {
                        let now = elapsed_ms(clock);
                        result.first_frame_ms = Some(now);
                        self.events.emit(&PipelineEvent::FirstFrame {
                            chunk: chunk.index,
                            attempt,
                            latency_ms: now - result.request_start_ms,
                        });
                    }

                    // Bytes of this attempt that earlier attempts already played.
                    let skip = result.bytes.saturating_sub(attempt_pcm.len()).min(frame.pcm.len());
                    attempt_pcm.extend_from_slice(&frame.pcm);
                    let fresh = &frame.pcm[skip..];
                    if !fresh.is_empty() {
                        let outcome = playback.submit(fresh).await?;
                        self.after_submit(chunk, &outcome, playback, clock, state, &mut result, fresh.len());
                    }
                    result.frames += 1;
                    finalized = frame.is_final;
                }
                Attempt::Retrying {
                    attempt,
                    delay,
                    kind,
                    message,
                } => {
                    self.events.emit(&PipelineEvent::Retry {
                        chunk: chunk.index,
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        kind,
                        error: message,
                        skipped_bytes: result.bytes,
                    });
                    result.attempts = attempt + 1;
                    state.network_attempts += 1;
                }
                Attempt::Cancelled => {
                    result.interrupted = true;
                }
            }
        }

        if result.interrupted {
            return Ok(result);
        }
        if !finalized {
            return Err(StreamError::network("synthesis ended without a final frame"));
        }

        if let Some(cache) = &self.cache {
            let cache = cache.clone();
            let key = key.to_string();
            let sample_rate = self.backend.sample_rate();
            let stored = tokio::task::spawn_blocking(move || cache.store(&key, &attempt_pcm, sample_rate)).await;
            match stored {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(chunk = chunk.index, error = %e, "failed to store chunk in cache"),
                Err(e) => warn!(chunk = chunk.index, error = %e, "cache store task failed"),
            }
        }
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn after_submit(
        &self,
        chunk: &Chunk,
        outcome: &SubmitOutcome,
        playback: &PlaybackBuffer,
        clock: Instant,
        state: &mut RunState,
        result: &mut ChunkResult,
        submitted: usize,
    ) {
        result.bytes += submitted;
        state.bytes_submitted += submitted;

        if result.playback_start_ms.is_none() && outcome.playing {
            let now = elapsed_ms(clock);
            result.playback_start_ms = Some(now);
            self.events.emit(&PipelineEvent::PlaybackStart {
                chunk: chunk.index,
                latency_ms: now - result.request_start_ms,
                prebuffer_ms: playback.prebuffer_ms(),
            });
        }
        if outcome.underrun_count > state.underruns_seen {
            state.underruns_seen = outcome.underrun_count;
            self.events.emit(&PipelineEvent::Underrun {
                count: outcome.underrun_count,
                prebuffer_ms: playback.prebuffer_ms(),
            });
        }
    }
}

fn elapsed_ms(clock: Instant) -> f64 {
    clock.elapsed().as_secs_f64() * 1000.0
}

/// Pair the pipeline result with the playback flush. When both fail the
/// pipeline error is the one reported.
fn settle(result: Result<RunOutcome>, flushed: Result<PlaybackStats>) -> Result<(RunOutcome, PlaybackStats)> {
    match (result, flushed) {
        (Ok(outcome), Ok(stats)) => Ok((outcome, stats)),
        (Ok(_), Err(flush_err)) => Err(flush_err),
        (Err(err), Ok(_)) => Err(err),
        (Err(err), Err(flush_err)) => {
            warn!(error = %flush_err, "playback flush failed after pipeline error");
            Err(err)
        }
    }
}
