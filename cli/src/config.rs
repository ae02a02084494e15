// Layered configuration: defaults < babbla.toml < environment < flags

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tts_backend::{BackendConfig, BackendKind};
use tts_core::{
    AdaptivePolicy, ControllerOptions, PhraseCache, PlaybackOptions, RetryPolicy, SynthesisSettings,
};

use crate::args::ConfigArgs;
use crate::error::CliError;

pub const DEFAULT_CONFIG_FILE: &str = "babbla.toml";
pub const API_KEY_ENV: &str = "ELEVENLABS_API_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl FromStr for LogFormat {
    type Err = CliError;

    fn from_str(s: &str) -> Result<Self, CliError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "text" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            other => Err(CliError::Config(format!(
                "log_format must be 'human' or 'json', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppConfig {
    pub api_key: Option<String>,
    pub voice_id: String,
    pub model_id: String,
    pub backend: BackendKind,
    pub sample_rate: u32,
    pub chunk_max_chars: usize,
    pub chunking: bool,
    pub prebuffer_ms: u32,
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: Option<f32>,
    pub rate: Option<f32>,
    pub cache_dir: Option<PathBuf>,
    pub cache_ttl: u64,
    pub log_format: LogFormat,
    pub retry_attempts: u32,
    pub backoff_base_ms: u64,
    pub timeout_ms: u64,
    pub latency_threshold_ms: f64,
    pub adapt_every: usize,
    pub min_chunk_chars: usize,
    pub optimize_streaming_latency: Option<u8>,
    /// Unknown keys from the config file, kept verbatim.
    pub extra: toml::Table,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            voice_id: "Rachel".to_string(),
            model_id: "eleven_monolingual_v1".to_string(),
            backend: BackendKind::WebSocket,
            sample_rate: 16_000,
            chunk_max_chars: 200,
            chunking: true,
            prebuffer_ms: 80,
            stability: 0.5,
            similarity_boost: 0.8,
            style: None,
            rate: None,
            cache_dir: None,
            cache_ttl: 7 * 24 * 60 * 60,
            log_format: LogFormat::Human,
            retry_attempts: 2,
            backoff_base_ms: 300,
            timeout_ms: 10_000,
            latency_threshold_ms: 600.0,
            adapt_every: 5,
            min_chunk_chars: 80,
            optimize_streaming_latency: Some(2),
            extra: toml::Table::new(),
        }
    }
}

/// One configuration source. `None` leaves the lower layer's value alone.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConfigLayer {
    pub api_key: Option<String>,
    pub voice_id: Option<String>,
    pub model_id: Option<String>,
    pub backend: Option<BackendKind>,
    pub sample_rate: Option<u32>,
    pub chunk_max_chars: Option<usize>,
    pub chunking: Option<bool>,
    pub prebuffer_ms: Option<u32>,
    pub stability: Option<f32>,
    pub similarity_boost: Option<f32>,
    pub style: Option<f32>,
    pub rate: Option<f32>,
    pub cache_dir: Option<PathBuf>,
    pub cache_ttl: Option<u64>,
    pub log_format: Option<LogFormat>,
    pub json_log: Option<bool>,
    pub retry_attempts: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub latency_threshold_ms: Option<f64>,
    pub adapt_every: Option<usize>,
    pub min_chunk_chars: Option<usize>,
    pub optimize_streaming_latency: Option<u8>,
    #[serde(flatten)]
    pub extra: toml::Table,
}

macro_rules! overlay {
    ($target:expr, $layer:expr; $($field:ident),+ $(,)?) => {
        $(if let Some(value) = $layer.$field { $target.$field = value; })+
    };
}

macro_rules! overlay_opt {
    ($target:expr, $layer:expr; $($field:ident),+ $(,)?) => {
        $(if let Some(value) = $layer.$field { $target.$field = Some(value); })+
    };
}

impl ConfigLayer {
    pub fn from_toml_str(raw: &str) -> Result<Self, CliError> {
        toml::from_str(raw).map_err(|e| CliError::Config(format!("invalid config file: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self, CliError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CliError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// `ELEVENLABS_API_KEY` and `BABBLA_*` variables, read through `lookup`.
    /// Empty values are ignored.
    pub fn from_env(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CliError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            api_key: get(API_KEY_ENV),
            voice_id: get("BABBLA_VOICE_ID"),
            model_id: get("BABBLA_MODEL_ID"),
            backend: env_value(&get, "BABBLA_BACKEND")?,
            sample_rate: env_value(&get, "BABBLA_SAMPLE_RATE")?,
            chunk_max_chars: env_value(&get, "BABBLA_CHUNK_MAX_CHARS")?,
            chunking: env_flag(&get, "BABBLA_CHUNKING"),
            prebuffer_ms: env_value(&get, "BABBLA_PREBUFFER_MS")?,
            stability: env_value(&get, "BABBLA_STABILITY")?,
            similarity_boost: env_value(&get, "BABBLA_SIMILARITY")?,
            style: env_value(&get, "BABBLA_STYLE")?,
            rate: env_value(&get, "BABBLA_RATE")?,
            cache_dir: get("BABBLA_CACHE_DIR").map(PathBuf::from),
            cache_ttl: env_value(&get, "BABBLA_CACHE_TTL")?,
            log_format: env_value(&get, "BABBLA_LOG_FORMAT")?,
            json_log: env_flag(&get, "BABBLA_JSON_LOG"),
            retry_attempts: env_value(&get, "BABBLA_RETRY_ATTEMPTS")?,
            backoff_base_ms: env_value(&get, "BABBLA_BACKOFF_BASE_MS")?,
            timeout_ms: env_value(&get, "BABBLA_TIMEOUT_MS")?,
            latency_threshold_ms: env_value(&get, "BABBLA_LATENCY_THRESHOLD_MS")?,
            adapt_every: env_value(&get, "BABBLA_ADAPT_EVERY")?,
            min_chunk_chars: env_value(&get, "BABBLA_MIN_CHUNK_CHARS")?,
            optimize_streaming_latency: env_value(&get, "BABBLA_OPTIMIZE_STREAMING_LATENCY")?,
            extra: toml::Table::new(),
        })
    }

    pub fn from_args(args: &ConfigArgs, json_log: bool) -> Result<Self, CliError> {
        let backend = args
            .backend
            .as_deref()
            .map(BackendKind::from_str)
            .transpose()?;
        Ok(Self {
            api_key: args.api_key.clone(),
            voice_id: args.voice_id.clone(),
            model_id: args.model_id.clone(),
            backend,
            sample_rate: args.sample_rate,
            chunk_max_chars: args.chunk_max_chars,
            chunking: args.no_chunking.then_some(false),
            prebuffer_ms: args.prebuffer_ms,
            stability: args.stability,
            similarity_boost: args.similarity_boost,
            style: args.style,
            rate: args.rate,
            cache_dir: args.cache_dir.clone(),
            cache_ttl: args.cache_ttl,
            log_format: None,
            json_log: json_log.then_some(true),
            retry_attempts: args.retry_attempts,
            backoff_base_ms: args.backoff_base_ms,
            timeout_ms: args.timeout_ms,
            latency_threshold_ms: args.latency_threshold_ms,
            adapt_every: args.adapt_every,
            min_chunk_chars: args.min_chunk_chars,
            optimize_streaming_latency: args.optimize_streaming_latency,
            extra: toml::Table::new(),
        })
    }
}

fn env_value<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, CliError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| CliError::Config(format!("{key}={raw:?} is invalid: {e}")))
        })
        .transpose()
}

fn env_flag(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    get(key).map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

impl AppConfig {
    pub fn apply(&mut self, layer: ConfigLayer) {
        overlay!(self, layer;
            voice_id, model_id, backend, sample_rate, chunk_max_chars, chunking, prebuffer_ms,
            stability, similarity_boost, cache_ttl, log_format, retry_attempts, backoff_base_ms,
            timeout_ms, latency_threshold_ms, adapt_every, min_chunk_chars,
        );
        overlay_opt!(self, layer;
            api_key, style, rate, cache_dir, optimize_streaming_latency,
        );
        if layer.json_log == Some(true) {
            self.log_format = LogFormat::Json;
        }
        self.extra.extend(layer.extra);
    }

    /// Merge every layer in precedence order and validate the result.
    ///
    /// An explicit `config_path` must exist; otherwise `./babbla.toml` is used
    /// when present.
    pub fn load(
        args: &ConfigArgs,
        json_log: bool,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, CliError> {
        let mut config = AppConfig::default();

        let file = match &args.config {
            Some(path) => Some(path.clone()),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                default.exists().then_some(default)
            }
        };
        if let Some(path) = file {
            config.apply(ConfigLayer::from_file(&path)?);
        }
        config.apply(ConfigLayer::from_env(env)?);
        config.apply(ConfigLayer::from_args(args, json_log)?);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CliError> {
        let unit = |name: &str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(CliError::Config(format!("{name} must be within [0, 1], got {v}")))
            }
        };
        unit("stability", self.stability)?;
        unit("similarity_boost", self.similarity_boost)?;
        if let Some(style) = self.style {
            unit("style", style)?;
        }
        if let Some(rate) = self.rate {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(CliError::Config(format!("rate must be positive, got {rate}")));
            }
        }
        if self.chunk_max_chars == 0 {
            return Err(CliError::Config("chunk_max_chars must be positive".into()));
        }
        if self.prebuffer_ms > tts_core::playback::MAX_PREBUFFER_MS {
            return Err(CliError::Config(format!(
                "prebuffer_ms must be at most {}, got {}",
                tts_core::playback::MAX_PREBUFFER_MS,
                self.prebuffer_ms
            )));
        }
        if self.cache_ttl == 0 {
            return Err(CliError::Config("cache_ttl must be positive".into()));
        }
        if self.timeout_ms == 0 {
            return Err(CliError::Config("timeout_ms must be positive".into()));
        }
        if self.sample_rate == 0 {
            return Err(CliError::Config("sample_rate must be positive".into()));
        }
        if let Some(level) = self.optimize_streaming_latency {
            if level > 4 {
                return Err(CliError::Config(format!(
                    "optimize_streaming_latency must be 0-4, got {level}"
                )));
            }
        }
        Ok(())
    }

    /// Copy safe to log.
    pub fn redacted(&self) -> Self {
        Self {
            api_key: self.api_key.as_deref().map(redact_key),
            ..self.clone()
        }
    }

    pub fn synthesis_settings(&self) -> SynthesisSettings {
        SynthesisSettings {
            voice_id: self.voice_id.clone(),
            model_id: self.model_id.clone(),
            stability: self.stability,
            similarity_boost: self.similarity_boost,
            style: self.style,
            rate: self.rate,
            optimize_streaming_latency: self.optimize_streaming_latency,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts.saturating_add(1),
            Duration::from_millis(self.backoff_base_ms),
        )
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            chunking: self.chunking,
            timeout: Duration::from_millis(self.timeout_ms),
            retry: self.retry_policy(),
            ..ControllerOptions::default()
        }
    }

    pub fn playback_options(&self) -> PlaybackOptions {
        PlaybackOptions::default().with_prebuffer_ms(self.prebuffer_ms)
    }

    pub fn adaptive_policy(&self) -> AdaptivePolicy {
        AdaptivePolicy {
            latency_threshold_ms: self.latency_threshold_ms,
            adapt_every: self.adapt_every,
            min_chars: self.min_chunk_chars,
            ..AdaptivePolicy::default()
        }
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            api_key: self.api_key.clone(),
            sample_rate: self.sample_rate,
            ..BackendConfig::default()
        }
    }

    /// The phrase cache, when a directory is configured.
    pub fn phrase_cache(&self) -> Result<Option<PhraseCache>, CliError> {
        self.cache_dir
            .as_ref()
            .map(|dir| PhraseCache::new(dir, Duration::from_secs(self.cache_ttl)))
            .transpose()
            .map_err(CliError::from)
    }
}

/// `****` followed by the last four characters.
pub fn redact_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("****{tail}")
}
