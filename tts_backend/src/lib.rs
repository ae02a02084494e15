//! Synthesis backends for the streaming pipeline and the ElevenLabs voice
//! catalog.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tts_core::{Backend, Result, StreamError};

pub mod elevenlabs_http;
pub mod elevenlabs_ws;
pub mod protocol;
pub mod simulated;
pub mod voices;

pub use elevenlabs_http::ElevenLabsHttpBackend;
pub use elevenlabs_ws::ElevenLabsWsBackend;
pub use simulated::SimulatedBackend;
pub use voices::{babbla_home, resolve_voice, simulated_voices, Voice, VoiceCatalog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    WebSocket,
    Http,
    Simulated,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::WebSocket => "websocket",
            BackendKind::Http => "http",
            BackendKind::Simulated => "simulated",
        }
    }

    pub fn needs_api_key(self) -> bool {
        !matches!(self, BackendKind::Simulated)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(BackendKind::WebSocket),
            "http" => Ok(BackendKind::Http),
            "simulated" | "sim" => Ok(BackendKind::Simulated),
            other => Err(StreamError::validation(format!(
                "unknown backend '{other}' (expected websocket, http or simulated)"
            ))),
        }
    }
}

/// Inputs for [`build_backend`].
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub api_key: Option<String>,
    pub sample_rate: u32,
    /// Override for the HTTP API base (`https://...`).
    pub api_base: Option<String>,
    /// Override for the WebSocket base (`wss://...`).
    pub ws_base: Option<String>,
    /// Simulated backend only.
    pub frame_delay: Option<Duration>,
}

pub fn build_backend(kind: BackendKind, config: &BackendConfig) -> Result<Arc<dyn Backend>> {
    if config.sample_rate == 0 {
        return Err(StreamError::validation("sample_rate must be positive"));
    }
    let api_key = || {
        config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| StreamError::Auth("ELEVENLABS_API_KEY is not set".into()))
    };

    let backend: Arc<dyn Backend> = match kind {
        BackendKind::WebSocket => {
            let mut backend = ElevenLabsWsBackend::new(api_key()?, config.sample_rate);
            if let Some(base) = &config.ws_base {
                backend = backend.with_base_url(base.clone());
            }
            Arc::new(backend)
        }
        BackendKind::Http => {
            let mut backend = ElevenLabsHttpBackend::new(api_key()?, config.sample_rate)?;
            if let Some(base) = &config.api_base {
                backend = backend.with_base_url(base.clone());
            }
            Arc::new(backend)
        }
        BackendKind::Simulated => {
            let mut backend = SimulatedBackend::new(config.sample_rate);
            if let Some(delay) = config.frame_delay {
                backend = backend.with_frame_delay(delay);
            }
            Arc::new(backend)
        }
    };
    tracing::debug!(backend = backend.name(), sample_rate = config.sample_rate, "backend ready");
    Ok(backend)
}
