//! Command line surface.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

/// Stream text to speech with low first-audio latency.
#[derive(Parser, Debug, Default)]
#[command(name = "babbla", author, version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub speak: SpeakArgs,

    #[command(flatten)]
    pub overrides: ConfigArgs,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the simulated pipeline repeatedly and write a latency report
    Harness(HarnessArgs),
}

#[derive(Args, Debug, Default, Clone)]
pub struct SpeakArgs {
    /// Text to synthesize. When omitted, use --file or pipe via stdin
    pub text: Option<String>,

    /// Read input text from a UTF-8 file
    #[arg(long, value_name = "PATH", conflicts_with = "text")]
    pub file: Option<PathBuf>,

    /// Also write the audio to a WAV file
    #[arg(long, value_name = "PATH")]
    pub save: Option<PathBuf>,

    /// Do not open an audio device
    #[arg(long)]
    pub no_playback: bool,

    /// Use the offline simulated backend
    #[arg(long)]
    pub simulate: bool,

    /// Print the chunk plan without synthesizing anything
    #[arg(long)]
    pub dry_run: bool,

    /// List available voices and exit
    #[arg(long)]
    pub list_voices: bool,

    /// Ignore the cached voice catalog
    #[arg(long)]
    pub refresh_voices: bool,

    /// Write per-chunk latency metrics as JSON
    #[arg(long, value_name = "PATH")]
    pub metrics_json: Option<PathBuf>,
}

/// Flags mirroring the configuration file. Unset flags leave lower layers alone.
#[derive(Args, Debug, Default, Clone)]
pub struct ConfigArgs {
    /// Configuration file (default ./babbla.toml when present)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// ElevenLabs API key (overrides environment and config file)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Voice id or (fuzzy) voice name
    #[arg(long = "voice")]
    pub voice_id: Option<String>,

    /// Model id
    #[arg(long = "model")]
    pub model_id: Option<String>,

    /// websocket, http or simulated
    #[arg(long)]
    pub backend: Option<String>,

    #[arg(long)]
    pub sample_rate: Option<u32>,

    /// Maximum characters per chunk
    #[arg(long = "max-chars")]
    pub chunk_max_chars: Option<usize>,

    /// Send the whole text as one request
    #[arg(long)]
    pub no_chunking: bool,

    /// Audio buffered before playback starts
    #[arg(long)]
    pub prebuffer_ms: Option<u32>,

    /// Voice stability (0..1)
    #[arg(long)]
    pub stability: Option<f32>,

    /// Similarity boost (0..1)
    #[arg(long = "similarity")]
    pub similarity_boost: Option<f32>,

    /// Style exaggeration (0..1)
    #[arg(long)]
    pub style: Option<f32>,

    /// Speaking rate multiplier
    #[arg(long)]
    pub rate: Option<f32>,

    /// Enable the phrase cache in this directory
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Cache time-to-live in seconds
    #[arg(long)]
    pub cache_ttl: Option<u64>,

    /// Retries after the first attempt
    #[arg(long)]
    pub retry_attempts: Option<u32>,

    #[arg(long)]
    pub backoff_base_ms: Option<u64>,

    /// Network timeout in milliseconds
    #[arg(long = "timeout", value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// p95 first-frame latency that shrinks chunks
    #[arg(long)]
    pub latency_threshold_ms: Option<f64>,

    #[arg(long)]
    pub adapt_every: Option<usize>,

    #[arg(long)]
    pub min_chunk_chars: Option<usize>,

    /// Backend latency optimization level (0-4)
    #[arg(long = "optimize-latency")]
    pub optimize_streaming_latency: Option<u8>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct OutputArgs {
    /// More logging (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_log: bool,
}

#[derive(Args, Debug, Clone)]
pub struct HarnessArgs {
    /// Number of runs
    #[arg(long, default_value_t = 5)]
    pub iterations: usize,

    /// Report destination
    #[arg(long, default_value = "latency_report.json")]
    pub output: PathBuf,

    /// Text to speak instead of the built-in paragraph
    #[arg(long)]
    pub text: Option<String>,

    /// Artificial delay before every simulated frame
    #[arg(long, default_value_t = 0)]
    pub frame_delay_ms: u64,

    #[command(flatten)]
    pub overrides: ConfigArgs,

    #[command(flatten)]
    pub output_args: OutputArgs,
}
