//! Scripted in-memory backend for driving the controller end to end.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tts_core::playback::PlaybackOptions;
use tts_core::{
    async_trait, Backend, BackendMessage, Connection, ControllerOptions, MemorySink,
    PlaybackBuffer, RetryPolicy, Result, StreamError, SynthesisRequest,
};

pub const RATE: u32 = 16_000;
/// 20 ms of PCM16 at 16 kHz.
pub const FRAME_BYTES: usize = 640;

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Auth,
    RateLimit,
    Transient,
    Malformed,
}

impl Failure {
    fn error(self) -> StreamError {
        match self {
            Failure::Auth => StreamError::Auth("invalid api key".into()),
            Failure::RateLimit => StreamError::RateLimit { retry_after: None },
            Failure::Transient => StreamError::network("connection reset"),
            Failure::Malformed => StreamError::malformed("bad payload"),
        }
    }
}

/// Behaviour of one connection.
#[derive(Debug, Clone, Copy)]
pub enum Script {
    Frames(usize),
    FailConnect(Failure),
    FailAfter { frames: usize, failure: Failure },
    /// Emits frames 0, 1, then 3.
    Gap,
    /// Emits `frames` frames, signals `paused`, then never answers again.
    Stall { frames: usize },
    /// Emits `frames` frames numbered from `first`, wrapping at `u64::MAX`.
    NumberedFrom { first: u64, frames: usize },
}

pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Script>>,
    default_frames: usize,
    frame_delay: Duration,
    pub connections: AtomicUsize,
    pub requests: Mutex<Vec<String>>,
    pub paused: Arc<Notify>,
}

impl ScriptedBackend {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            default_frames: 5,
            frame_delay: Duration::ZERO,
            connections: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            paused: Arc::new(Notify::new()),
        }
    }

    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

/// Frame `seq` is filled with byte `seq + 1`, never zero, so played audio can
/// be told apart from silence padding.
pub fn frame_pcm(seq: usize) -> Vec<u8> {
    vec![(seq % 250) as u8 + 1; FRAME_BYTES]
}

struct ScriptedConnection {
    messages: VecDeque<Result<BackendMessage>>,
    stall: Option<Arc<Notify>>,
    delay: Duration,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn send(&mut self, _request: &SynthesisRequest) -> Result<()> {
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<BackendMessage>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.messages.pop_front() {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e),
            None => match &self.stall {
                Some(paused) => {
                    paused.notify_one();
                    std::future::pending::<()>().await;
                    Ok(None)
                }
                None => Ok(None),
            },
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn numbered(count: usize, final_last: bool) -> VecDeque<Result<BackendMessage>> {
    (0..count)
        .map(|seq| {
            Ok(BackendMessage {
                pcm: frame_pcm(seq),
                is_final: final_last && seq + 1 == count,
                sequence_no: Some(seq as u64),
            })
        })
        .collect()
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn sample_rate(&self) -> u32 {
        RATE
    }

    async fn connect(&self, request: &SynthesisRequest) -> Result<Box<dyn Connection>> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.text.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Frames(self.default_frames));

        let (messages, stall) = match script {
            Script::Frames(n) => (numbered(n, true), None),
            Script::FailConnect(failure) => return Err(failure.error()),
            Script::FailAfter { frames, failure } => {
                let mut messages = numbered(frames, false);
                messages.push_back(Err(failure.error()));
                (messages, None)
            }
            Script::Gap => {
                let mut messages = numbered(2, false);
                messages.push_back(Ok(BackendMessage {
                    pcm: frame_pcm(3),
                    is_final: true,
                    sequence_no: Some(3),
                }));
                (messages, None)
            }
            Script::Stall { frames } => (numbered(frames, false), Some(Arc::clone(&self.paused))),
            Script::NumberedFrom { first, frames } => {
                let messages = (0..frames)
                    .map(|i| {
                        Ok(BackendMessage {
                            pcm: frame_pcm(i),
                            is_final: i + 1 == frames,
                            sequence_no: Some(first.wrapping_add(i as u64)),
                        })
                    })
                    .collect();
                (messages, None)
            }
        };

        Ok(Box::new(ScriptedConnection {
            messages,
            stall,
            delay: self.frame_delay,
        }))
    }
}

pub fn fast_playback(sink: &MemorySink) -> PlaybackBuffer {
    let options = PlaybackOptions {
        tick: Duration::from_millis(5),
        ..PlaybackOptions::default()
    }
    .with_speed(20.0);
    PlaybackBuffer::new(Box::new(sink.clone()), options)
}

pub fn quick_options() -> ControllerOptions {
    ControllerOptions {
        timeout: Duration::from_secs(2),
        retry: RetryPolicy::new(3, Duration::from_millis(10)),
        ..ControllerOptions::default()
    }
}

/// Sink bytes with silence padding removed.
pub fn audible(sink: &MemorySink) -> Vec<u8> {
    sink.bytes().into_iter().filter(|b| *b != 0).collect()
}

pub fn frames_audio(seqs: std::ops::Range<usize>) -> Vec<u8> {
    seqs.flat_map(frame_pcm).collect()
}
