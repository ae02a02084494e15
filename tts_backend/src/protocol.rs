//! Pieces of the ElevenLabs wire protocol shared by the WebSocket and HTTP
//! backends: request bodies, endpoint URLs and status classification.

use std::time::Duration;

use reqwest::Url;
use serde::Serialize;
use serde_json::{json, Value};
use tts_core::{StreamError, SynthesisSettings};

pub const DEFAULT_API_BASE: &str = "https://api.elevenlabs.io";
pub const DEFAULT_WS_BASE: &str = "wss://api.elevenlabs.io";
pub const API_KEY_HEADER: &str = "xi-api-key";

/// Longest error body quoted back in an error message.
const DETAIL_LIMIT: usize = 256;

#[derive(Debug, Serialize, PartialEq)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaking_rate: Option<f32>,
}

impl From<&SynthesisSettings> for VoiceSettings {
    fn from(settings: &SynthesisSettings) -> Self {
        Self {
            stability: settings.stability,
            similarity_boost: settings.similarity_boost,
            style: settings.style,
            speaking_rate: settings.rate,
        }
    }
}

/// `pcm_<rate>` output format name.
pub fn output_format(sample_rate: u32) -> String {
    format!("pcm_{sample_rate}")
}

/// `{base}/v1/text-to-speech/{voice}/{tail}` with the voice id escaped as a
/// path segment.
pub fn tts_url(base: &str, voice_id: &str, tail: &str) -> Result<Url, StreamError> {
    let mut url = Url::parse(base)
        .map_err(|e| StreamError::validation(format!("invalid backend url {base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| StreamError::validation(format!("backend url {base} cannot be a base")))?
        .pop_if_empty()
        .extend(["v1", "text-to-speech", voice_id, tail]);
    Ok(url)
}

/// Query parameters common to both streaming endpoints.
pub fn append_stream_query(url: &mut Url, settings: &SynthesisSettings, sample_rate: u32, with_model: bool) {
    let mut query = url.query_pairs_mut();
    if with_model {
        query.append_pair("model_id", &settings.model_id);
    }
    query.append_pair("output_format", &output_format(sample_rate));
    if let Some(level) = settings.optimize_streaming_latency {
        query.append_pair("optimize_streaming_latency", &level.to_string());
    }
}

/// JSON body for the HTTP streaming endpoint.
pub fn http_body(text: &str, settings: &SynthesisSettings) -> Value {
    json!({
        "text": text,
        "model_id": settings.model_id,
        "voice_settings": VoiceSettings::from(settings),
    })
}

/// Parse a `retry-after` header given in seconds.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    let secs: f64 = value?.trim().parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Map an HTTP status (handshake or plain request) onto the failure taxonomy.
pub fn classify_status(status: u16, retry_after: Option<Duration>, detail: &str) -> StreamError {
    let detail = truncate(detail);
    match status {
        401 | 403 => StreamError::Auth(format!("backend rejected credentials ({status}){detail}")),
        429 => StreamError::RateLimit { retry_after },
        500..=599 => StreamError::network(format!("backend upstream error ({status}){detail}")),
        _ => StreamError::malformed(format!("backend request failed ({status}){detail}")),
    }
}

/// Classify an error payload or close reason sent by the server mid-stream.
pub fn classify_message(message: &str) -> StreamError {
    let lower = message.to_lowercase();
    if lower.contains("api key")
        || lower.contains("api_key")
        || lower.contains("unauthorized")
        || lower.contains("authenticat")
    {
        StreamError::Auth(message.to_string())
    } else if lower.contains("rate limit") || lower.contains("too many") || lower.contains("concurren") {
        StreamError::RateLimit { retry_after: None }
    } else if lower.contains("timeout") || lower.contains("timed out") || lower.contains("unavailable") {
        StreamError::network(message.to_string())
    } else {
        StreamError::malformed(message.to_string())
    }
}

fn truncate(detail: &str) -> String {
    let detail = detail.trim();
    if detail.is_empty() {
        return String::new();
    }
    let clipped: String = detail.chars().take(DETAIL_LIMIT).collect();
    format!(": {clipped}")
}
