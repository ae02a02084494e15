//! Top-level command dispatch for the `babbla` binary.

use std::io::{Read, Write};

use chrono::Utc;
use tracing::{debug, info, warn};
use tts_backend::{babbla_home, build_backend, resolve_voice, simulated_voices, BackendKind, Voice, VoiceCatalog};
use tts_core::chunker::{split, split_whole};
use tts_core::{
    AudioSink, CancellationToken, NullSink, PlaybackBuffer, RunContext, RunOutcome, StreamingController,
    SynthesisSettings, WavCapture,
};

use crate::args::{Cli, Command, SpeakArgs};
use crate::config::AppConfig;
use crate::error::CliError;
use crate::harness;
use crate::logging;
use crate::metrics::{write_json, RunMetricsFile};
use crate::validation::resolve_input_text;

/// Drain clock multiplier when nothing is listening.
pub const SILENT_DRAIN_SPEED: f64 = 100.0;

/// Where input text comes from when no TEXT or --file is given.
pub struct Stdin<R> {
    pub reader: R,
    pub is_terminal: bool,
}

pub async fn execute<R: Read>(
    cli: Cli,
    env: impl Fn(&str) -> Option<String>,
    stdin: Stdin<R>,
    out: &mut dyn Write,
    cancel: CancellationToken,
) -> Result<(), CliError> {
    if let Some(Command::Harness(args)) = cli.command {
        let config = AppConfig::load(&args.overrides, args.output_args.json_log, env)?;
        logging::init(&args.output_args, config.log_format);
        debug!(config = ?config.redacted(), "configuration loaded");
        return harness::run(&args, &config, &cancel).await.map(|_| ());
    }

    let config = AppConfig::load(&cli.overrides, cli.output.json_log, env)?;
    logging::init(&cli.output, config.log_format);
    debug!(config = ?config.redacted(), "configuration loaded");
    if !config.extra.is_empty() {
        debug!(keys = ?config.extra.keys().collect::<Vec<_>>(), "ignoring unknown configuration keys");
    }

    let speak = &cli.speak;
    let kind = if speak.simulate {
        BackendKind::Simulated
    } else {
        config.backend
    };

    if speak.list_voices {
        return list_voices(kind, &config, speak.refresh_voices, out).await;
    }

    if speak.dry_run {
        let text = input_text(speak, stdin)?;
        return dry_run(&text, &config, out);
    }

    if kind.needs_api_key() && config.api_key.is_none() {
        return Err(CliError::MissingApiKey);
    }
    let text = input_text(speak, stdin)?;
    speak_text(&text, kind, speak, &config, &cancel).await
}

fn input_text<R: Read>(speak: &SpeakArgs, stdin: Stdin<R>) -> Result<String, CliError> {
    resolve_input_text(
        speak.text.as_deref(),
        speak.file.as_deref(),
        stdin.reader,
        stdin.is_terminal,
    )
}

async fn list_voices(
    kind: BackendKind,
    config: &AppConfig,
    refresh: bool,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let voices = if kind == BackendKind::Simulated {
        simulated_voices()
    } else {
        let home = babbla_home()
            .ok_or_else(|| CliError::Config("cannot determine the babbla home directory".into()))?;
        VoiceCatalog::new(home)
            .voices(config.api_key.as_deref(), refresh)
            .await?
    };

    if voices.is_empty() {
        writeln!(out, "No voices available.")?;
        return Ok(());
    }
    writeln!(out, "Available voices:")?;
    for voice in &voices {
        writeln!(
            out,
            "- {}: {} ({})",
            voice.voice_id,
            voice.name,
            voice.description.as_deref().unwrap_or("")
        )?;
    }
    Ok(())
}

/// Frames the simulated backend would roughly need: one per 40 characters.
pub fn estimated_frames(char_len: usize) -> usize {
    ((char_len as f64 / 40.0).round() as usize).max(1)
}

fn dry_run(text: &str, config: &AppConfig, out: &mut dyn Write) -> Result<(), CliError> {
    let chunks = if config.chunking {
        split(text, config.chunk_max_chars)?
    } else {
        split_whole(text)?
    };
    writeln!(out, "Dry run mode. No synthesis performed.")?;
    writeln!(
        out,
        "Voice: {} | Model: {} | Stability: {} | Similarity: {}",
        config.voice_id, config.model_id, config.stability, config.similarity_boost
    )?;
    writeln!(
        out,
        "Chunks: {} total (max_chars={})",
        chunks.len(),
        config.chunk_max_chars
    )?;
    for chunk in &chunks {
        let len = chunk.char_len();
        writeln!(
            out,
            "  {}. length={len} chars | estimated_frames={}",
            chunk.index + 1,
            estimated_frames(len)
        )?;
    }
    Ok(())
}

/// Map a voice name onto an id using whatever catalog is at hand without
/// touching the network. Unknown names pass through unchanged.
fn resolve_voice_id(requested: &str, voices: &[Voice]) -> String {
    match resolve_voice(requested, voices) {
        Some(voice) => {
            if voice.voice_id != requested {
                info!(requested, voice_id = %voice.voice_id, name = %voice.name, "resolved voice");
            }
            voice.voice_id.clone()
        }
        None => {
            debug!(requested, "voice not in catalog, using as id");
            requested.to_string()
        }
    }
}

fn known_voices(kind: BackendKind) -> Vec<Voice> {
    match kind {
        BackendKind::Simulated => simulated_voices(),
        _ => babbla_home()
            .and_then(|home| VoiceCatalog::new(home).load_cached(Utc::now()))
            .unwrap_or_default(),
    }
}

/// Output sink and drain speed for this run.
fn output_sink(no_playback: bool) -> (Box<dyn AudioSink>, f64) {
    if no_playback {
        return (Box::new(NullSink), SILENT_DRAIN_SPEED);
    }
    #[cfg(feature = "device")]
    {
        (Box::new(tts_core::device::CpalSink::new()), 1.0)
    }
    #[cfg(not(feature = "device"))]
    {
        warn!("built without the `device` feature; audio is discarded (use --no-playback to silence this)");
        (Box::new(NullSink), 1.0)
    }
}

async fn speak_text(
    text: &str,
    kind: BackendKind,
    speak: &SpeakArgs,
    config: &AppConfig,
    cancel: &CancellationToken,
) -> Result<(), CliError> {
    let run_id = uuid::Uuid::new_v4().to_string();
    let settings = SynthesisSettings {
        voice_id: resolve_voice_id(&config.voice_id, &known_voices(kind)),
        ..config.synthesis_settings()
    };

    let backend = build_backend(kind, &config.backend_config())?;
    let mut controller = StreamingController::new(backend, settings.clone(), config.controller_options());
    if let Some(cache) = config.phrase_cache()? {
        controller = controller.with_cache(cache);
    }

    let (sink, speed) = output_sink(speak.no_playback);
    let mut playback = PlaybackBuffer::new(sink, config.playback_options().with_speed(speed));
    if let Some(path) = &speak.save {
        playback = playback.with_capture(WavCapture::new(path.clone()));
    }
    let mut ctx = RunContext::new(config.chunk_max_chars, config.prebuffer_ms, config.adaptive_policy());

    info!(run_id = %run_id, backend = %kind, voice_id = %settings.voice_id, chars = text.chars().count(), "speaking");
    let report = controller.run(text, &mut playback, &mut ctx, cancel).await?;

    if let Some(path) = &speak.metrics_json {
        write_json(path, &RunMetricsFile::new(&run_id, kind.as_str(), &settings.voice_id, &report))?;
    }
    if let Some(capture) = &report.playback.capture {
        if !capture.ok {
            warn!(path = %capture.path.display(), "WAV capture incomplete");
        }
    }

    match report.outcome {
        RunOutcome::Completed => info!(
            chunks = report.chunks,
            cache_hits = report.cache_hits,
            p95_first_frame_ms = report.summary.p95_first_frame_ms,
            underruns = report.playback.underrun_count,
            "playback finished"
        ),
        RunOutcome::Interrupted { chunk } => warn!(chunk, "interrupted"),
    }
    Ok(())
}

/// Trip `cancel` on the first Ctrl-C.
pub fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping");
            cancel.cancel();
        }
    });
}
