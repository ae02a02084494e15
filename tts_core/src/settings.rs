use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};

/// Voice and model parameters for one run. Part of the cache key identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisSettings {
    pub voice_id: String,
    pub model_id: String,
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: Option<f32>,
    pub rate: Option<f32>,
    /// Backend latency hint (0-4 for ElevenLabs). Not part of the cache key.
    #[serde(default)]
    pub optimize_streaming_latency: Option<u8>,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            voice_id: "Rachel".to_string(),
            model_id: "eleven_monolingual_v1".to_string(),
            stability: 0.5,
            similarity_boost: 0.8,
            style: None,
            rate: None,
            optimize_streaming_latency: None,
        }
    }
}

impl SynthesisSettings {
    pub fn new(voice_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            voice_id: voice_id.into(),
            model_id: model_id.into(),
            ..Self::default()
        }
    }

    /// Check ranges before any network activity.
    pub fn validate(&self) -> Result<()> {
        if self.voice_id.trim().is_empty() {
            return Err(StreamError::validation("voice_id cannot be empty"));
        }
        if self.model_id.trim().is_empty() {
            return Err(StreamError::validation("model_id cannot be empty"));
        }
        check_unit("stability", self.stability)?;
        check_unit("similarity_boost", self.similarity_boost)?;
        if let Some(style) = self.style {
            check_unit("style", style)?;
        }
        if let Some(rate) = self.rate {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(StreamError::validation(format!(
                    "rate must be positive, got {rate}"
                )));
            }
        }
        Ok(())
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(StreamError::validation(format!(
            "{name} must be between 0.0 and 1.0, got {value}"
        )))
    }
}

/// One unit of decoded mono PCM16 (little endian) audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub sequence_no: u64,
    pub is_final: bool,
}

impl AudioFrame {
    pub fn new(pcm: Vec<u8>, sample_rate: u32, sequence_no: u64, is_final: bool) -> Self {
        Self {
            pcm,
            sample_rate,
            sequence_no,
            is_final,
        }
    }

    pub fn duration_ms(&self) -> f64 {
        pcm_duration_ms(self.pcm.len(), self.sample_rate)
    }
}

/// Bytes of mono PCM16 audio for `ms` milliseconds.
pub fn bytes_for_ms(ms: u32, sample_rate: u32) -> usize {
    let samples = (sample_rate as u64 * ms as u64) / 1000;
    (samples * 2) as usize
}

pub fn pcm_duration_ms(len: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    (len / 2) as f64 * 1000.0 / sample_rate as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        assert!(SynthesisSettings::default().validate().is_ok());
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let mut s = SynthesisSettings::default();
        s.stability = 1.5;
        assert!(matches!(s.validate(), Err(StreamError::Validation(_))));

        let mut s = SynthesisSettings::default();
        s.style = Some(-0.1);
        assert!(s.validate().is_err());

        let mut s = SynthesisSettings::default();
        s.rate = Some(0.0);
        assert!(s.validate().is_err());

        let mut s = SynthesisSettings::default();
        s.voice_id = "  ".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_pcm_sizes() {
        assert_eq!(bytes_for_ms(80, 16_000), 2_560);
        assert_eq!(bytes_for_ms(200, 22_050), 8_820);
        assert_eq!(pcm_duration_ms(3_200, 16_000), 100.0);
        let frame = AudioFrame::new(vec![0; 6_400], 16_000, 0, true);
        assert_eq!(frame.duration_ms(), 200.0);
    }
}
