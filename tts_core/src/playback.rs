//! Jitter buffer between synthesis and the audio output.
//!
//! The buffer is the only state shared between the network side (async
//! `submit`) and the drain thread that feeds the sink at the nominal sample
//! rate. Both sides go through one mutex, so a submitted frame is either fully
//! visible to the drain or not at all.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{Result, StreamError};
use crate::settings::{bytes_for_ms, pcm_duration_ms};
use crate::wav::{CaptureSummary, WavCapture};

pub const DEFAULT_PREBUFFER_MS: u32 = 80;
pub const MAX_PREBUFFER_MS: u32 = 200;
pub const UNDERRUN_STEP_MS: u32 = 20;

/// Push-style PCM16 output.
pub trait AudioSink: Send + Sync {
    fn name(&self) -> &str;
    fn open(&mut self, sample_rate: u32) -> Result<()>;
    fn write(&mut self, pcm: &[u8]) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Discards audio. Used by `--no-playback` and as the device fallback.
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    fn open(&mut self, _sample_rate: u32) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, _pcm: &[u8]) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    bytes: Vec<u8>,
    sample_rate: Option<u32>,
    opens: usize,
    closed: bool,
}

/// Collects everything written. Clones share the same storage, so a test can
/// keep a handle while the buffer owns the sink.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemoryInner>>,
    failing_opens: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `n` calls to `open` fail.
    pub fn failing(n: usize) -> Self {
        Self {
            inner: Arc::default(),
            failing_opens: n,
        }
    }

    fn inner(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.inner().bytes.clone()
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.inner().sample_rate
    }

    pub fn open_attempts(&self) -> usize {
        self.inner().opens
    }

    pub fn is_closed(&self) -> bool {
        self.inner().closed
    }
}

impl AudioSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn open(&mut self, sample_rate: u32) -> Result<()> {
        let mut inner = self.inner();
        inner.opens += 1;
        if inner.opens <= self.failing_opens {
            return Err(StreamError::DeviceUnavailable("memory sink refused to open".into()));
        }
        inner.sample_rate = Some(sample_rate);
        inner.closed = false;
        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) -> Result<()> {
        self.inner().bytes.extend_from_slice(pcm);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.inner().closed = true;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackOptions {
    pub prebuffer_ms: u32,
    pub max_prebuffer_ms: u32,
    pub underrun_step_ms: u32,
    /// Drain clock multiplier; 1.0 is real time.
    pub speed: f64,
    pub tick: Duration,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            prebuffer_ms: DEFAULT_PREBUFFER_MS,
            max_prebuffer_ms: MAX_PREBUFFER_MS,
            underrun_step_ms: UNDERRUN_STEP_MS,
            speed: 1.0,
            tick: Duration::from_millis(10),
        }
    }
}

impl PlaybackOptions {
    pub fn with_prebuffer_ms(mut self, prebuffer_ms: u32) -> Self {
        self.prebuffer_ms = prebuffer_ms.min(self.max_prebuffer_ms);
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }
}

/// Snapshot of the buffer, in milliseconds of audio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BufferState {
    pub capacity_ms: f64,
    pub filled_ms: f64,
    pub underrun_count: u32,
    pub prebuffer_ms: u32,
    pub playing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOutcome {
    /// This submit crossed the prebuffer threshold and (re)started playback.
    pub started: bool,
    pub playing: bool,
    pub underrun_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Push {
    accepted: bool,
    started: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Drained {
    audio: Vec<u8>,
    silence: usize,
    underrun: bool,
}

/// Pure buffer bookkeeping, no clocks and no threads.
#[derive(Debug)]
struct RingState {
    data: VecDeque<u8>,
    capacity: usize,
    sample_rate: u32,
    prebuffer_ms: u32,
    max_prebuffer_ms: u32,
    step_ms: u32,
    playing: bool,
    flushing: bool,
    failure: Option<String>,
    underrun_count: u32,
    played_bytes: u64,
}

impl RingState {
    fn new(sample_rate: u32, options: &PlaybackOptions) -> Self {
        let prebuffer_ms = options.prebuffer_ms.min(options.max_prebuffer_ms);
        let capacity = bytes_for_ms(prebuffer_ms, sample_rate).max(2);
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
            sample_rate,
            prebuffer_ms,
            max_prebuffer_ms: options.max_prebuffer_ms,
            step_ms: options.underrun_step_ms,
            playing: false,
            flushing: false,
            failure: None,
            underrun_count: 0,
            played_bytes: 0,
        }
    }

    fn prebuffer_bytes(&self) -> usize {
        bytes_for_ms(self.prebuffer_ms, self.sample_rate)
    }

    fn try_push(&mut self, pcm: &[u8]) -> Push {
        // A frame always lands whole, so the ring grows to fit the largest one.
        if pcm.len() > self.capacity {
            self.capacity = pcm.len();
        }
        if self.data.len() + pcm.len() > self.capacity {
            // Full before the threshold: start anyway so the drain makes room.
            let started = !self.playing;
            self.playing = true;
            return Push {
                accepted: false,
                started,
            };
        }

        self.data.extend(pcm);
        let started = !self.playing && self.data.len() >= self.prebuffer_bytes();
        if started {
            self.playing = true;
        }
        Push {
            accepted: true,
            started,
        }
    }

    fn drain(&mut self, want: usize) -> Drained {
        if !self.playing && !self.flushing {
            // Rebuffering after an underrun keeps the device fed with silence.
            if self.underrun_count > 0 {
                return Drained {
                    audio: Vec::new(),
                    silence: want,
                    underrun: false,
                };
            }
            return Drained::default();
        }
        let n = want.min(self.data.len());
        let audio: Vec<u8> = self.data.drain(..n).collect();
        self.played_bytes += n as u64;

        if n < want && !self.flushing {
            self.underrun_count += 1;
            self.prebuffer_ms = (self.prebuffer_ms + self.step_ms).min(self.max_prebuffer_ms);
            self.capacity = self.capacity.max(self.prebuffer_bytes());
            // Rebuffer up to the raised threshold before resuming.
            self.playing = false;
            return Drained {
                audio,
                silence: want - n,
                underrun: true,
            };
        }
        Drained {
            audio,
            silence: 0,
            underrun: false,
        }
    }

    fn snapshot(&self) -> BufferState {
        BufferState {
            capacity_ms: pcm_duration_ms(self.capacity, self.sample_rate),
            filled_ms: pcm_duration_ms(self.data.len(), self.sample_rate),
            underrun_count: self.underrun_count,
            prebuffer_ms: self.prebuffer_ms,
            playing: self.playing,
        }
    }
}

struct Shared {
    state: Mutex<RingState>,
    space: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackStats {
    pub underrun_count: u32,
    pub prebuffer_ms: u32,
    pub played_ms: f64,
    pub capture: Option<CaptureSummary>,
}

/// Ring buffer plus the drain thread feeding an [`AudioSink`].
pub struct PlaybackBuffer {
    options: PlaybackOptions,
    sink: Option<Box<dyn AudioSink>>,
    fallback: Option<Box<dyn AudioSink>>,
    capture: Option<WavCapture>,
    shared: Arc<Shared>,
    drain: Option<JoinHandle<()>>,
    stats: Option<PlaybackStats>,
}

impl PlaybackBuffer {
    pub fn new(sink: Box<dyn AudioSink>, options: PlaybackOptions) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(RingState::new(16_000, &options)),
            space: Notify::new(),
        });
        Self {
            options,
            sink: Some(sink),
            fallback: None,
            capture: None,
            shared,
            drain: None,
            stats: None,
        }
    }

    /// Sink to try when the primary one cannot open.
    pub fn with_fallback(mut self, sink: Box<dyn AudioSink>) -> Self {
        self.fallback = Some(sink);
        self
    }

    pub fn with_capture(mut self, capture: WavCapture) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn options(&self) -> &PlaybackOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.drain.is_some()
    }

    /// Open the output and start draining. One fallback attempt: the
    /// configured fallback sink, otherwise the primary sink again.
    pub fn start(&mut self, sample_rate: u32) -> Result<()> {
        if self.drain.is_some() {
            return Ok(());
        }
        if sample_rate == 0 {
            return Err(StreamError::validation("sample rate must be positive"));
        }
        let mut primary = self
            .sink
            .take()
            .ok_or_else(|| StreamError::DeviceUnavailable("output sink already released".into()))?;

        let sink = match primary.open(sample_rate) {
            Ok(()) => primary,
            Err(first) => {
                warn!(sink = primary.name(), error = %first, "output sink failed to open, trying fallback");
                let mut second = self.fallback.take().unwrap_or(primary);
                match second.open(sample_rate) {
                    Ok(()) => {
                        info!(sink = second.name(), "using fallback output sink");
                        second
                    }
                    Err(e) => {
                        return Err(StreamError::DeviceUnavailable(format!(
                            "{first}; fallback {} failed: {e}",
                            second.name()
                        )))
                    }
                }
            }
        };

        *self.shared.lock() = RingState::new(sample_rate, &self.options);
        if let Some(capture) = self.capture.as_mut() {
            capture.open(sample_rate);
        }

        let shared = Arc::clone(&self.shared);
        let speed = if self.options.speed.is_finite() && self.options.speed > 0.0 {
            self.options.speed
        } else {
            1.0
        };
        let tick = self.options.tick.max(Duration::from_millis(1));
        let handle = std::thread::Builder::new()
            .name("babbla-playback".into())
            .spawn(move || drain_loop(shared, sink, sample_rate, speed, tick))
            .map_err(|e| StreamError::DeviceUnavailable(format!("cannot start playback thread: {e}")))?;
        self.drain = Some(handle);
        debug!(sample_rate, prebuffer_ms = self.options.prebuffer_ms, "playback started");
        Ok(())
    }

    /// Append PCM, waiting for room when the ring is full.
    pub async fn submit(&self, pcm: &[u8]) -> Result<SubmitOutcome> {
        if self.drain.is_none() {
            return Err(StreamError::DeviceUnavailable("playback is not running".into()));
        }
        let mut started = false;
        loop {
            let notified = self.shared.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if let Some(reason) = &state.failure {
                    return Err(StreamError::DeviceUnavailable(reason.clone()));
                }
                if state.flushing {
                    return Err(StreamError::DeviceUnavailable("playback is closing".into()));
                }
                let push = state.try_push(pcm);
                started |= push.started;
                if push.accepted {
                    if let Some(capture) = &self.capture {
                        capture.write(pcm);
                    }
                    return Ok(SubmitOutcome {
                        started,
                        playing: state.playing,
                        underrun_count: state.underrun_count,
                    });
                }
            }

            notified.await;
        }
    }

    pub fn state(&self) -> BufferState {
        self.shared.lock().snapshot()
    }

    pub fn underrun_count(&self) -> u32 {
        self.shared.lock().underrun_count
    }

    /// Current threshold, raised by underruns.
    pub fn prebuffer_ms(&self) -> u32 {
        self.shared.lock().prebuffer_ms
    }

    /// Play out whatever is buffered, then release the sink and finalize the
    /// capture. Safe to call repeatedly and after failures.
    pub async fn flush_and_close(&mut self) -> Result<PlaybackStats> {
        if let Some(stats) = &self.stats {
            return Ok(stats.clone());
        }

        {
            let mut state = self.shared.lock();
            state.flushing = true;
        }
        self.shared.space.notify_waiters();

        if let Some(handle) = self.drain.take() {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!("playback thread ended abnormally");
            }
        }
        let capture = match self.capture.take() {
            Some(mut capture) => tokio::task::spawn_blocking(move || capture.finish())
                .await
                .ok()
                .flatten(),
            None => None,
        };

        let stats = {
            let state = self.shared.lock();
            PlaybackStats {
                underrun_count: state.underrun_count,
                prebuffer_ms: state.prebuffer_ms,
                played_ms: pcm_duration_ms(state.played_bytes as usize, state.sample_rate),
                capture,
            }
        };
        debug!(
            underruns = stats.underrun_count,
            played_ms = stats.played_ms,
            "playback closed"
        );
        self.stats = Some(stats.clone());
        Ok(stats)
    }
}

impl Drop for PlaybackBuffer {
    fn drop(&mut self) {
        // Let a still-running drain thread play out and exit on its own.
        if self.drain.is_some() {
            self.shared.lock().flushing = true;
        }
    }
}

fn bytes_per_tick(sample_rate: u32, speed: f64, tick: Duration) -> usize {
    let samples = (sample_rate as f64 * tick.as_secs_f64() * speed).round() as usize;
    samples.max(1) * 2
}

fn drain_loop(
    shared: Arc<Shared>,
    mut sink: Box<dyn AudioSink>,
    sample_rate: u32,
    speed: f64,
    tick: Duration,
) {
    let want = bytes_per_tick(sample_rate, speed, tick);
    let silence = vec![0u8; want];

    loop {
        let (drained, done) = {
            let mut state = shared.lock();
            let drained = state.drain(want);
            (drained, state.flushing && state.data.is_empty())
        };

        let mut written = Ok(());
        if !drained.audio.is_empty() {
            written = sink.write(&drained.audio);
        }
        if written.is_ok() && drained.silence > 0 {
            written = sink.write(&silence[..drained.silence.min(want)]);
        }
        if drained.underrun {
            debug!(silence_bytes = drained.silence, "playback underrun");
        }
        if let Err(e) = written {
            warn!(sink = sink.name(), error = %e, "output sink write failed");
            let mut state = shared.lock();
            state.failure = Some(e.to_string());
            drop(state);
            shared.space.notify_waiters();
            break;
        }

        shared.space.notify_waiters();
        if done {
            break;
        }
        std::thread::sleep(tick);
    }

    if let Err(e) = sink.close() {
        warn!(sink = sink.name(), error = %e, "error closing output sink");
    }
}
