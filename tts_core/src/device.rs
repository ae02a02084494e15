//! Default output device through cpal.
//!
//! `cpal::Stream` is not `Send`, so the stream lives on its own thread for the
//! lifetime of the sink. Written PCM goes into a shared sample queue that the
//! device callback pops from, emitting silence when the queue runs dry.

use std::collections::VecDeque;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, warn};

use crate::error::{Result, StreamError};
use crate::playback::AudioSink;

const CLOSE_GRACE: Duration = Duration::from_secs(2);

type SampleQueue = Arc<Mutex<VecDeque<i16>>>;

#[derive(Default)]
pub struct CpalSink {
    queue: SampleQueue,
    stop: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
    carry: Option<u8>,
}

impl CpalSink {
    pub fn new() -> Self {
        Self::default()
    }
}

fn build_stream(sample_rate: u32, queue: SampleQueue) -> std::result::Result<cpal::Stream, String> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| "no default output device".to_string())?;
    let channels = device
        .default_output_config()
        .map(|c| c.channels())
        .unwrap_or(1)
        .max(1);
    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
                for frame in data.chunks_mut(channels as usize) {
                    let sample = queue.pop_front().unwrap_or(0) as f32 / 32768.0;
                    frame.fill(sample);
                }
            },
            |err| warn!(error = %err, "audio device error"),
            None,
        )
        .map_err(|e| format!("cannot build output stream at {sample_rate} Hz: {e}"))?;
    stream
        .play()
        .map_err(|e| format!("cannot start output stream: {e}"))?;
    Ok(stream)
}

impl AudioSink for CpalSink {
    fn name(&self) -> &str {
        "cpal"
    }

    fn open(&mut self, sample_rate: u32) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let queue = Arc::clone(&self.queue);

        let worker = std::thread::Builder::new()
            .name("babbla-device".into())
            .spawn(move || match build_stream(sample_rate, queue) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Hold the stream until the sink closes.
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| StreamError::DeviceUnavailable(format!("cannot start device thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                debug!(sample_rate, "output device opened");
                self.stop = Some(stop_tx);
                self.worker = Some(worker);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(StreamError::DeviceUnavailable(e))
            }
            Err(_) => {
                let _ = worker.join();
                Err(StreamError::DeviceUnavailable("device thread exited".into()))
            }
        }
    }

    fn write(&mut self, pcm: &[u8]) -> Result<()> {
        if self.worker.is_none() {
            return Err(StreamError::DeviceUnavailable("output device is not open".into()));
        }
        let mut bytes = pcm;
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lo) = self.carry.take() {
            match bytes.split_first() {
                Some((&hi, rest)) => {
                    queue.push_back(i16::from_le_bytes([lo, hi]));
                    bytes = rest;
                }
                None => {
                    self.carry = Some(lo);
                    return Ok(());
                }
            }
        }
        let pairs = bytes.chunks_exact(2);
        self.carry = pairs.remainder().first().copied();
        queue.extend(pairs.map(|p| i16::from_le_bytes([p[0], p[1]])));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        // Let the device play out what is queued.
        let deadline = Instant::now() + CLOSE_GRACE;
        while Instant::now() < deadline {
            let pending = self.queue.lock().unwrap_or_else(|e| e.into_inner()).len();
            if pending == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.stop.take();
        worker
            .join()
            .map_err(|_| StreamError::DeviceUnavailable("device thread panicked".into()))
    }
}
