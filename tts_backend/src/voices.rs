//! Voice catalog: fetched from the API, cached on disk for a day, searched by
//! id, name or approximate name.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use tts_core::{Result, StreamError};

use crate::elevenlabs_http::map_reqwest_error;
use crate::protocol::{classify_status, parse_retry_after, API_KEY_HEADER, DEFAULT_API_BASE};

pub const CATALOG_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const CATALOG_FILE: &str = "voices.json";
const MIN_MATCH_SCORE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voice {
    pub voice_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Voice {
    pub fn new(voice_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            voice_id: voice_id.into(),
            name: name.into(),
            description: None,
            category: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    fetched_at: DateTime<Utc>,
    voices: Vec<Voice>,
}

#[derive(Debug, Deserialize)]
struct VoicesResponse {
    #[serde(default)]
    voices: Vec<Voice>,
}

/// `$BABBLA_HOME`, else `~/.babbla`.
pub fn babbla_home() -> Option<PathBuf> {
    if let Some(home) = std::env::var_os("BABBLA_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(home));
    }
    dirs::home_dir().map(|home| home.join(".babbla"))
}

/// The fixed voices offered by the simulated backend.
pub fn simulated_voices() -> Vec<Voice> {
    vec![
        Voice {
            description: Some("Friendly English voice".into()),
            ..Voice::new("voice_stub_1", "Ava (stub)")
        },
        Voice {
            description: Some("Calm narration voice".into()),
            ..Voice::new("voice_stub_2", "Liam (stub)")
        },
    ]
}

#[derive(Debug, Clone)]
pub struct VoiceCatalog {
    dir: PathBuf,
    ttl: Duration,
    api_base: String,
    client: reqwest::Client,
}

impl VoiceCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ttl: CATALOG_TTL,
            api_base: DEFAULT_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CATALOG_FILE)
    }

    /// Cached voices when the file exists, parses and is younger than the TTL.
    pub fn load_cached(&self, now: DateTime<Utc>) -> Option<Vec<Voice>> {
        let raw = fs::read_to_string(self.path()).ok()?;
        let file: CatalogFile = match serde_json::from_str(&raw) {
            Ok(file) => file,
            Err(e) => {
                debug!(error = %e, "ignoring unreadable voice catalog");
                return None;
            }
        };
        let age = now.signed_duration_since(file.fetched_at).to_std().ok()?;
        (age <= self.ttl).then_some(file.voices)
    }

    pub fn store(&self, voices: &[Voice], now: DateTime<Utc>) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let file = CatalogFile {
            fetched_at: now,
            voices: voices.to_vec(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| StreamError::Cache(format!("failed to encode voice catalog: {e}")))?;
        let tmp = self.dir.join(format!("{CATALOG_FILE}.tmp"));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, self.path())?;
        Ok(())
    }

    /// Cached catalog unless `force_refresh`, otherwise fetched and stored.
    pub async fn voices(&self, api_key: Option<&str>, force_refresh: bool) -> Result<Vec<Voice>> {
        if !force_refresh {
            if let Some(voices) = self.load_cached(Utc::now()) {
                return Ok(voices);
            }
        }
        let api_key = api_key.ok_or_else(|| {
            StreamError::Auth("an API key is required to fetch the voice catalog".into())
        })?;
        let voices = self.fetch(api_key).await?;
        if let Err(e) = self.store(&voices, Utc::now()) {
            warn!(error = %e, path = %self.path().display(), "could not cache voice catalog");
        }
        Ok(voices)
    }

    async fn fetch(&self, api_key: &str) -> Result<Vec<Voice>> {
        let url = format!("{}/v1/voices", self.api_base.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            );
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), retry_after, &detail));
        }
        let body: VoicesResponse = response.json().await.map_err(map_reqwest_error)?;
        debug!(count = body.voices.len(), "fetched voice catalog");
        Ok(body.voices)
    }
}

/// Exact id or name (case-insensitive) first, else the best approximate name
/// match scoring at least 0.5.
pub fn resolve_voice<'a>(query: &str, voices: &'a [Voice]) -> Option<&'a Voice> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return None;
    }
    if let Some(exact) = voices
        .iter()
        .find(|v| v.voice_id.to_lowercase() == query || v.name.to_lowercase() == query)
    {
        return Some(exact);
    }

    // Ties go to substring matches.
    let mut best: Option<(&Voice, f64, bool)> = None;
    for voice in voices {
        let name = voice.name.to_lowercase();
        let contains = name.contains(&query);
        let score = if contains {
            (query.chars().count() as f64 / name.chars().count() as f64).max(0.5)
        } else {
            similarity(&query, &name)
        };
        let better = best.map_or(true, |(_, top, top_contains)| {
            score > top || (score == top && contains && !top_contains)
        });
        if better {
            best = Some((voice, score, contains));
        }
    }
    best.filter(|(_, score, _)| *score >= MIN_MATCH_SCORE)
        .map(|(voice, _, _)| voice)
}

/// `1 - levenshtein / longer length`, in [0, 1].
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            row[j + 1] = substitution.min(prev[j + 1] + 1).min(row[j] + 1);
        }
        std::mem::swap(&mut prev, &mut row);
    }
    1.0 - prev[b.len()] as f64 / longest as f64
}
