//! WAV capture of the played PCM stream.
//!
//! Writing happens on a dedicated thread fed through a channel, so a slow or
//! failing disk never holds up live playback. Failures are logged and the
//! capture keeps swallowing audio until it is finished.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;

use serde::Serialize;
use tracing::{debug, warn};

use crate::settings::pcm_duration_ms;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureSummary {
    pub path: PathBuf,
    pub sample_rate: u32,
    pub bytes_written: u64,
    pub duration_ms: f64,
    pub ok: bool,
}

pub struct WavCapture {
    path: PathBuf,
    tx: Option<mpsc::Sender<Vec<u8>>>,
    worker: Option<JoinHandle<CaptureSummary>>,
}

impl WavCapture {
    /// Nothing touches the disk until [`WavCapture::open`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tx: None,
            worker: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.tx.is_some()
    }

    /// Start the writer thread once the sample rate is known. Repeat calls
    /// are ignored.
    pub fn open(&mut self, sample_rate: u32) {
        if self.worker.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let path = self.path.clone();
        let spawned = std::thread::Builder::new()
            .name("babbla-capture".into())
            .spawn(move || write_wav(path, sample_rate, rx));
        match spawned {
            Ok(handle) => {
                self.tx = Some(tx);
                self.worker = Some(handle);
            }
            Err(e) => warn!(path = %self.path.display(), error = %e, "cannot start capture writer"),
        }
    }

    /// Queue PCM for the file. Never blocks.
    pub fn write(&self, pcm: &[u8]) {
        if let Some(tx) = &self.tx {
            if tx.send(pcm.to_vec()).is_err() {
                debug!(path = %self.path.display(), "capture writer gone, dropping audio");
            }
        }
    }

    /// Close the channel and wait for the header to be finalized. Blocking;
    /// async callers should go through `spawn_blocking`. Idempotent.
    pub fn finish(&mut self) -> Option<CaptureSummary> {
        self.tx.take();
        let worker = self.worker.take()?;
        match worker.join() {
            Ok(summary) => Some(summary),
            Err(_) => {
                warn!(path = %self.path.display(), "capture writer panicked");
                None
            }
        }
    }
}

impl Drop for WavCapture {
    fn drop(&mut self) {
        self.finish();
    }
}

fn write_wav(path: PathBuf, sample_rate: u32, rx: mpsc::Receiver<Vec<u8>>) -> CaptureSummary {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut summary = CaptureSummary {
        path: path.clone(),
        sample_rate,
        bytes_written: 0,
        duration_ms: 0.0,
        ok: false,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(path = %path.display(), error = %e, "cannot create capture directory");
        }
    }

    let mut writer = match hound::WavWriter::create(&path, spec) {
        Ok(writer) => Some(writer),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot create capture file");
            None
        }
    };

    // A frame may end on half a sample; carry the byte to the next frame.
    let mut carry: Option<u8> = None;
    for pcm in rx {
        let Some(w) = writer.as_mut() else {
            continue;
        };
        let mut bytes = pcm.as_slice();
        if let Some(lo) = carry.take() {
            if let Some((&hi, rest)) = bytes.split_first() {
                if let Err(e) = w.write_sample(i16::from_le_bytes([lo, hi])) {
                    warn!(path = %path.display(), error = %e, "capture write failed");
                    writer = None;
                    continue;
                }
                summary.bytes_written += 2;
                bytes = rest;
            } else {
                carry = Some(lo);
                continue;
            }
        }
        let mut pairs = bytes.chunks_exact(2);
        let mut failed = false;
        for pair in &mut pairs {
            if let Err(e) = w.write_sample(i16::from_le_bytes([pair[0], pair[1]])) {
                warn!(path = %path.display(), error = %e, "capture write failed");
                failed = true;
                break;
            }
            summary.bytes_written += 2;
        }
        if failed {
            writer = None;
            continue;
        }
        carry = pairs.remainder().first().copied();
    }

    if let Some(w) = writer {
        match w.finalize() {
            Ok(()) => summary.ok = true,
            Err(e) => warn!(path = %path.display(), error = %e, "cannot finalize capture file"),
        }
    }
    summary.duration_ms = pcm_duration_ms(summary.bytes_written as usize, sample_rate);
    debug!(
        path = %path.display(),
        bytes = summary.bytes_written,
        ok = summary.ok,
        "capture finished"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_capture_writes_valid_wav() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.wav");
        let mut capture = WavCapture::new(&path);
        capture.open(16_000);
        let samples: Vec<i16> = vec![0, 1000, -1000, i16::MAX, i16::MIN];
        let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        // Split mid-sample to exercise the carry.
        capture.write(&pcm[..3]);
        capture.write(&pcm[3..]);
        let summary = capture.finish().unwrap();
        assert!(summary.ok);
        assert_eq!(summary.bytes_written, 10);

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.spec().channels, 1);
        let read: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(read, samples);
    }

    #[test]
    fn test_unopened_capture_ignores_audio() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("never.wav");
        let mut capture = WavCapture::new(&path);
        capture.write(&[0, 0, 1, 1]);
        assert!(capture.finish().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_unwritable_path_does_not_panic() {
        let dir = TempDir::new().unwrap();
        // A directory where the file should be.
        let path = dir.path().join("taken");
        std::fs::create_dir(&path).unwrap();
        let mut capture = WavCapture::new(&path);
        capture.open(16_000);
        capture.write(&[1, 2, 3, 4]);
        let summary = capture.finish().unwrap();
        assert!(!summary.ok);
        assert_eq!(summary.bytes_written, 0);
    }

    #[test]
    fn test_finish_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut capture = WavCapture::new(dir.path().join("a.wav"));
        capture.open(22_050);
        capture.write(&[0; 8]);
        assert!(capture.finish().is_some());
        assert!(capture.finish().is_none());
    }
}
