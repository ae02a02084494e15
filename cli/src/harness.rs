//! `babbla harness`: repeated simulated runs sharing one [`RunContext`], so
//! chunk-size adaptation and prebuffer growth carry across iterations.

use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use tts_backend::{build_backend, BackendKind};
use tts_core::{CancellationToken, NullSink, PlaybackBuffer, RunContext, RunOutcome, StreamingController};

use crate::app::SILENT_DRAIN_SPEED;
use crate::args::HarnessArgs;
use crate::config::AppConfig;
use crate::error::CliError;
use crate::metrics::{write_json, HarnessAggregate, HarnessReport, IterationRecord};
use crate::validation::validate_text;

pub const DEFAULT_TEXT: &str = "Streaming speech should start quickly. The first sentence is sent on its own \
so that audio begins while the rest is still being synthesized. Later sentences follow in order, \
each one a separate request. A jitter buffer smooths over uneven arrival times. \
When the backend slows down, chunks get shorter. Underruns raise the prebuffer for the next run.";

/// Run the harness and write its report to `args.output`.
///
/// The phrase cache is never used here: cached chunks would hide backend latency.
pub async fn run(
    args: &HarnessArgs,
    config: &AppConfig,
    cancel: &CancellationToken,
) -> Result<HarnessReport, CliError> {
    if args.iterations == 0 {
        return Err(CliError::InvalidInput("iterations must be positive".into()));
    }
    let text = args.text.as_deref().unwrap_or(DEFAULT_TEXT);
    validate_text(text)?;

    let backend_config = tts_backend::BackendConfig {
        frame_delay: (args.frame_delay_ms > 0).then(|| Duration::from_millis(args.frame_delay_ms)),
        ..config.backend_config()
    };
    let backend = build_backend(BackendKind::Simulated, &backend_config)?;
    let controller = StreamingController::new(backend, config.synthesis_settings(), config.controller_options());

    let mut ctx = RunContext::new(config.chunk_max_chars, config.prebuffer_ms, config.adaptive_policy());
    let mut runs = Vec::with_capacity(args.iterations);

    for iteration in 0..args.iterations {
        let options = config
            .playback_options()
            .with_prebuffer_ms(ctx.prebuffer_ms)
            .with_speed(SILENT_DRAIN_SPEED);
        let mut playback = PlaybackBuffer::new(Box::new(NullSink), options);
        let report = controller.run(text, &mut playback, &mut ctx, cancel).await?;

        info!(
            iteration,
            chunks = report.chunks,
            p95_first_frame_ms = report.summary.p95_first_frame_ms,
            max_chars = ctx.max_chars,
            "harness iteration done"
        );
        runs.push(IterationRecord {
            iteration,
            chunks: report.chunks,
            cache_hits: report.cache_hits,
            max_chars_after: ctx.max_chars,
            prebuffer_ms_after: ctx.prebuffer_ms,
            underruns: report.playback.underrun_count,
            summary: report.summary,
        });

        if let RunOutcome::Interrupted { chunk } = report.outcome {
            warn!(iteration, chunk, "harness interrupted");
            break;
        }
    }

    let report = HarnessReport {
        generated_at: Utc::now(),
        iterations: runs.len(),
        text_chars: text.chars().count(),
        sample_rate: config.sample_rate,
        aggregate: HarnessAggregate::from_metrics(runs.len(), ctx.metrics()),
        runs,
    };
    write_json(&args.output, &report)?;
    Ok(report)
}
