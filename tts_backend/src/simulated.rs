//! Deterministic offline backend: a sine tone whose pitch is derived from the
//! chunk text, delivered as a fixed number of frames.

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tts_core::{Backend, BackendMessage, Connection, Result, SynthesisRequest};

pub const FRAME_COUNT: usize = 5;
pub const FRAME_MS: u32 = 200;
const AMPLITUDE: f64 = 0.25 * i16::MAX as f64;

#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    sample_rate: u32,
    frame_delay: Option<Duration>,
}

impl SimulatedBackend {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frame_delay: None,
        }
    }

    /// Sleep before every frame, standing in for network latency.
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = (!delay.is_zero()).then_some(delay);
        self
    }
}

/// Tone frequency in [220, 440) Hz, stable for a given text.
pub fn tone_frequency(text: &str) -> f64 {
    let digest = Sha256::digest(text.trim().as_bytes());
    let bucket = u16::from_be_bytes([digest[0], digest[1]]) % 220;
    220.0 + bucket as f64
}

/// All frames for `text`, phase-continuous across frame boundaries.
pub fn render(text: &str, sample_rate: u32) -> Vec<Vec<u8>> {
    let samples_per_frame = (sample_rate as usize * FRAME_MS as usize) / 1000;
    let text = text.trim();
    let freq = tone_frequency(text);

    (0..FRAME_COUNT)
        .map(|frame| {
            let mut pcm = Vec::with_capacity(samples_per_frame * 2);
            for i in 0..samples_per_frame {
                let sample = if text.is_empty() {
                    0
                } else {
                    let n = (frame * samples_per_frame + i) as f64;
                    (AMPLITUDE * (2.0 * PI * freq * n / sample_rate as f64).sin()) as i16
                };
                pcm.extend_from_slice(&sample.to_le_bytes());
            }
            pcm
        })
        .collect()
}

struct SimulatedConnection {
    sample_rate: u32,
    frame_delay: Option<Duration>,
    frames: VecDeque<Vec<u8>>,
    next_seq: u64,
}

#[async_trait]
impl Connection for SimulatedConnection {
    async fn send(&mut self, request: &SynthesisRequest) -> Result<()> {
        self.frames = render(&request.text, self.sample_rate).into();
        self.next_seq = 0;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<BackendMessage>> {
        let Some(pcm) = self.frames.pop_front() else {
            return Ok(None);
        };
        if let Some(delay) = self.frame_delay {
            tokio::time::sleep(delay).await;
        }
        let message = BackendMessage {
            pcm,
            is_final: self.frames.is_empty(),
            sequence_no: Some(self.next_seq),
        };
        self.next_seq += 1;
        Ok(Some(message))
    }

    async fn close(&mut self) -> Result<()> {
        self.frames.clear();
        Ok(())
    }
}

#[async_trait]
impl Backend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn connect(&self, _request: &SynthesisRequest) -> Result<Box<dyn Connection>> {
        Ok(Box::new(SimulatedConnection {
            sample_rate: self.sample_rate,
            frame_delay: self.frame_delay,
            frames: VecDeque::new(),
            next_seq: 0,
        }))
    }
}
