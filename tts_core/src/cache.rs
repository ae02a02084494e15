//! Content-addressed phrase cache on disk.
//!
//! Layout: `<dir>/<key[..2]>/<key>.pcm` holds raw PCM16, `<key>.json` holds
//! [`EntryMeta`]. An entry that fails its integrity check is removed and
//! reported as absent.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Result, StreamError};
use crate::settings::SynthesisSettings;

pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    created_at: DateTime<Utc>,
    ttl_secs: u64,
    sample_rate: u32,
    byte_len: u64,
    sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

#[derive(Serialize)]
struct KeyDocument<'a> {
    voice_id: &'a str,
    model_id: &'a str,
    stability: f64,
    similarity_boost: f64,
    style: Option<f64>,
    rate: Option<f64>,
    text: &'a str,
}

fn round4(v: f32) -> f64 {
    (v as f64 * 10_000.0).round() / 10_000.0
}

/// SHA-256 (lowercase hex) over a canonical JSON document of the settings that
/// shape the audio plus the exact chunk text.
pub fn key_for(settings: &SynthesisSettings, text: &str) -> String {
    let doc = KeyDocument {
        voice_id: &settings.voice_id,
        model_id: &settings.model_id,
        stability: round4(settings.stability),
        similarity_boost: round4(settings.similarity_boost),
        style: settings.style.map(round4),
        rate: settings.rate.map(round4),
        text,
    };
    // Field order is fixed by the struct, so the document is canonical.
    let payload = serde_json::to_vec(&doc).unwrap_or_default();
    hex::encode(Sha256::digest(&payload))
}

fn is_valid_key(key: &str) -> bool {
    key.len() == 64 && key.bytes().all(|b| b.is_ascii_hexdigit())
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn is_expired(created_at: DateTime<Utc>, ttl_secs: u64, now: DateTime<Utc>) -> bool {
    let ttl_ms = i64::try_from(ttl_secs).unwrap_or(i64::MAX).saturating_mul(1000);
    now.signed_duration_since(created_at).num_milliseconds() > ttl_ms
}

/// Cheap to clone; hand a copy to `spawn_blocking` for disk work.
#[derive(Debug, Clone)]
pub struct PhraseCache {
    dir: PathBuf,
    ttl: Duration,
}

impl PhraseCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self> {
        let dir = dir.into();
        if ttl.is_zero() {
            return Err(StreamError::validation("cache ttl must be positive"));
        }
        fs::create_dir_all(&dir)
            .map_err(|e| StreamError::Cache(format!("cannot create {}: {e}", dir.display())))?;
        Ok(Self { dir, ttl })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let bucket = self.dir.join(&key[..2]);
        (bucket.join(format!("{key}.pcm")), bucket.join(format!("{key}.json")))
    }

    pub fn lookup(&self, key: &str) -> Option<CacheEntry> {
        self.lookup_at(key, Utc::now())
    }

    /// Absent when missing, expired at `now`, or corrupt. Expired and corrupt
    /// entries are removed on the way out.
    pub fn lookup_at(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        if !is_valid_key(key) {
            return None;
        }
        let (pcm_path, meta_path) = self.paths(key);
        if !meta_path.exists() {
            return None;
        }

        let meta: EntryMeta = match fs::read(&meta_path)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
        {
            Some(meta) => meta,
            None => {
                debug!(key, "cache metadata unreadable, removing entry");
                remove_pair(&pcm_path, &meta_path);
                return None;
            }
        };

        if is_expired(meta.created_at, meta.ttl_secs, now) {
            debug!(key, created_at = %meta.created_at, "cache entry expired");
            remove_pair(&pcm_path, &meta_path);
            return None;
        }

        let pcm = match fs::read(&pcm_path) {
            Ok(pcm) => pcm,
            Err(e) => {
                debug!(key, error = %e, "cache audio unreadable, removing entry");
                remove_pair(&pcm_path, &meta_path);
                return None;
            }
        };

        if meta.key != key || pcm.len() as u64 != meta.byte_len || sha256_hex(&pcm) != meta.sha256 {
            warn!(key, "cache entry failed integrity check, removing");
            remove_pair(&pcm_path, &meta_path);
            return None;
        }

        Some(CacheEntry {
            key: meta.key,
            pcm,
            sample_rate: meta.sample_rate,
            created_at: meta.created_at,
            ttl: Duration::from_secs(meta.ttl_secs),
        })
    }

    pub fn store(&self, key: &str, pcm: &[u8], sample_rate: u32) -> Result<()> {
        self.store_at(key, pcm, sample_rate, Utc::now())
    }

    /// Overwrite the entry for `key`. The audio lands before the metadata, so a
    /// reader never sees metadata pointing at a half-written blob.
    pub fn store_at(&self, key: &str, pcm: &[u8], sample_rate: u32, now: DateTime<Utc>) -> Result<()> {
        if !is_valid_key(key) {
            return Err(StreamError::Cache(format!("invalid cache key {key:?}")));
        }
        let (pcm_path, meta_path) = self.paths(key);
        if let Some(bucket) = pcm_path.parent() {
            fs::create_dir_all(bucket)?;
        }

        let meta = EntryMeta {
            key: key.to_string(),
            created_at: now,
            ttl_secs: self.ttl.as_secs().max(1),
            sample_rate,
            byte_len: pcm.len() as u64,
            sha256: sha256_hex(pcm),
        };
        let meta_json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| StreamError::Cache(format!("cannot encode metadata: {e}")))?;

        write_atomic(&pcm_path, pcm)?;
        write_atomic(&meta_path, &meta_json)?;
        debug!(key, bytes = pcm.len(), sample_rate, "cache entry stored");
        Ok(())
    }

    /// Remove every expired or unreadable entry. Returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        let shards = match fs::read_dir(&self.dir) {
            Ok(shards) => shards,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        for shard in shards.flatten() {
            let shard_path = shard.path();
            if !shard_path.is_dir() {
                continue;
            }
            for file in fs::read_dir(&shard_path)?.flatten() {
                let meta_path = file.path();
                if meta_path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let expired = fs::read(&meta_path)
                    .ok()
                    .and_then(|raw| serde_json::from_slice::<EntryMeta>(&raw).ok())
                    .map_or(true, |meta| is_expired(meta.created_at, meta.ttl_secs, now));
                if expired {
                    remove_pair(&meta_path.with_extension("pcm"), &meta_path);
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!(removed, dir = %self.dir.display(), "cache sweep finished");
        }
        Ok(removed)
    }

    /// Number of entries with metadata on disk.
    pub fn len(&self) -> usize {
        let Ok(shards) = fs::read_dir(&self.dir) else {
            return 0;
        };
        shards
            .flatten()
            .filter_map(|s| fs::read_dir(s.path()).ok())
            .flat_map(|files| files.flatten())
            .filter(|f| f.path().extension().and_then(|e| e.to_str()) == Some("json"))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("part")
    ));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_pair(pcm_path: &Path, meta_path: &Path) {
    for path in [pcm_path, meta_path] {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove cache file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache(dir: &TempDir, ttl_secs: u64) -> PhraseCache {
        PhraseCache::new(dir.path(), Duration::from_secs(ttl_secs)).unwrap()
    }

    #[test]
    fn test_key_is_deterministic() {
        let s = SynthesisSettings::default();
        let a = key_for(&s, "Hello world.");
        let b = key_for(&s, "Hello world.");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(is_valid_key(&a));
    }

    #[test]
    fn test_any_field_change_changes_key() {
        let base = SynthesisSettings::default();
        let text = "Hello world.";
        let reference = key_for(&base, text);

        let variants: Vec<SynthesisSettings> = vec![
            SynthesisSettings { voice_id: "Adam".into(), ..base.clone() },
            SynthesisSettings { model_id: "eleven_turbo_v2".into(), ..base.clone() },
            SynthesisSettings { stability: 0.51, ..base.clone() },
            SynthesisSettings { similarity_boost: 0.7, ..base.clone() },
            SynthesisSettings { style: Some(0.2), ..base.clone() },
            SynthesisSettings { rate: Some(1.1), ..base.clone() },
        ];
        for v in variants {
            assert_ne!(key_for(&v, text), reference, "{v:?}");
        }
        assert_ne!(key_for(&base, "Hello world!"), reference);
        assert_ne!(key_for(&base, "Hello  world."), reference);
    }

    #[test]
    fn test_latency_hint_does_not_change_key() {
        let base = SynthesisSettings::default();
        let hinted = SynthesisSettings {
            optimize_streaming_latency: Some(3),
            ..base.clone()
        };
        assert_eq!(key_for(&base, "x"), key_for(&hinted, "x"));
    }

    #[test]
    fn test_store_then_lookup_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 60);
        let key = key_for(&SynthesisSettings::default(), "Cached phrase.");
        let pcm: Vec<u8> = (0..=255u8).cycle().take(3_200).collect();

        cache.store(&key, &pcm, 16_000).unwrap();
        let entry = cache.lookup(&key).expect("entry present");
        assert_eq!(entry.pcm, pcm);
        assert_eq!(entry.sample_rate, 16_000);
        assert_eq!(cache.len(), 1);
        assert!(dir.path().join(&key[..2]).join(format!("{key}.pcm")).exists());
    }

    #[test]
    fn test_store_is_idempotent_overwrite() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 60);
        let key = key_for(&SynthesisSettings::default(), "Again.");
        cache.store(&key, &[1, 2, 3, 4], 16_000).unwrap();
        cache.store(&key, &[5, 6], 22_050).unwrap();
        let entry = cache.lookup(&key).unwrap();
        assert_eq!(entry.pcm, vec![5, 6]);
        assert_eq!(entry.sample_rate, 22_050);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expired_entry_is_absent_and_removed() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 10);
        let key = key_for(&SynthesisSettings::default(), "Old news.");
        let t0 = Utc::now();
        cache.store_at(&key, &[0; 64], 16_000, t0).unwrap();

        assert!(cache.lookup_at(&key, t0 + chrono::Duration::seconds(10)).is_some());
        assert!(cache.lookup_at(&key, t0 + chrono::Duration::seconds(11)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_corrupt_entry_is_absent_and_removed() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 60);
        let key = key_for(&SynthesisSettings::default(), "Tampered.");
        cache.store(&key, &[7; 128], 16_000).unwrap();

        let pcm_path = dir.path().join(&key[..2]).join(format!("{key}.pcm"));
        fs::write(&pcm_path, [8u8; 128]).unwrap();

        assert!(cache.lookup(&key).is_none());
        assert!(!pcm_path.exists());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_garbage_metadata_is_treated_as_miss() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 60);
        let key = key_for(&SynthesisSettings::default(), "Garbage.");
        cache.store(&key, &[1; 16], 16_000).unwrap();
        let meta_path = dir.path().join(&key[..2]).join(format!("{key}.json"));
        fs::write(&meta_path, b"{not json").unwrap();

        assert!(cache.lookup(&key).is_none());
        assert!(!meta_path.exists());
    }

    #[test]
    fn test_missing_and_invalid_keys_are_misses() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 60);
        assert!(cache.lookup(&"ab".repeat(32)).is_none());
        assert!(cache.lookup("../../etc/passwd").is_none());
        assert!(matches!(
            cache.store("nothex", &[0; 4], 16_000),
            Err(StreamError::Cache(_))
        ));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 100);
        let s = SynthesisSettings::default();
        let t0 = Utc::now();
        let old = key_for(&s, "old");
        let fresh = key_for(&s, "fresh");
        cache.store_at(&old, &[1; 8], 16_000, t0 - chrono::Duration::seconds(500)).unwrap();
        cache.store_at(&fresh, &[2; 8], 16_000, t0).unwrap();

        assert_eq!(cache.sweep(t0).unwrap(), 1);
        assert!(cache.lookup_at(&old, t0).is_none());
        assert!(cache.lookup_at(&fresh, t0).is_some());
        assert_eq!(cache.sweep(t0).unwrap(), 0);
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(PhraseCache::new(dir.path(), Duration::ZERO).is_err());
    }
}
