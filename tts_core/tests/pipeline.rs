mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tempfile::TempDir;
use tts_core::chunker::normalize_whitespace;
use tts_core::playback::{PlaybackOptions, MAX_PREBUFFER_MS};
use tts_core::{
    AdaptivePolicy, CancellationToken, FailureKind, MemorySink, PhraseCache, PipelineEvent,
    PlaybackBuffer, RecordingEventSink, RunContext, RunOutcome, StreamError, StreamingController,
    SynthesisSettings, WavCapture,
};

fn controller(
    backend: &Arc<ScriptedBackend>,
    events: &Arc<RecordingEventSink>,
) -> StreamingController {
    StreamingController::new(backend.clone(), SynthesisSettings::default(), quick_options())
        .with_events(events.clone())
}

fn context(max_chars: usize) -> RunContext {
    RunContext::new(max_chars, 80, AdaptivePolicy::default())
}

/// Drains at the nominal rate, so a slow backend can starve it.
fn realtime_playback(sink: &MemorySink, prebuffer_ms: u32) -> PlaybackBuffer {
    PlaybackBuffer::new(
        Box::new(sink.clone()),
        PlaybackOptions::default().with_prebuffer_ms(prebuffer_ms),
    )
}

#[tokio::test]
async fn test_second_identical_run_is_served_from_cache() {
    let dir = TempDir::new().unwrap();
    let cache = PhraseCache::new(dir.path(), Duration::from_secs(3600)).unwrap();
    let backend = Arc::new(ScriptedBackend::new(vec![Script::Frames(5)]));
    let events = Arc::new(RecordingEventSink::new());
    let controller = controller(&backend, &events).with_cache(cache.clone());
    let text = "Hello low latency world.";

    let sink = MemorySink::new();
    let mut ctx = context(200);
    let report = controller
        .run(text, &mut fast_playback(&sink), &mut ctx, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.chunks, 1);
    assert_eq!(backend.connections(), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(audible(&sink), frames_audio(0..5));

    let replay_sink = MemorySink::new();
    events.clear();
    let report = controller
        .run(text, &mut fast_playback(&replay_sink), &mut ctx, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(backend.connections(), 1, "cache hit must not touch the network");
    assert_eq!(report.cache_hits, 1);
    assert_eq!(report.network_attempts, 0);
    assert_eq!(events.count("cache_hit"), 1);
    assert_eq!(events.count("cache_miss"), 0);
    assert_eq!(audible(&replay_sink), frames_audio(0..5));
}

#[tokio::test]
async fn test_three_sentences_are_chunked_in_order() {
    let backend = Arc::new(ScriptedBackend::new(vec![]));
    let events = Arc::new(RecordingEventSink::new());
    let text = "The first sentence is right here. The second one follows it closely.   \
                A third sentence ends this small paragraph.";

    let sink = MemorySink::new();
    let report = controller(&backend, &events)
        .run(text, &mut fast_playback(&sink), &mut context(50), &CancellationToken::new())
        .await
        .unwrap();

    let requests = backend.requests();
    assert!(requests.len() >= 3);
    assert!(requests.iter().all(|t| t.chars().count() <= 50));
    assert_eq!(requests.join(" "), normalize_whitespace(text));
    assert_eq!(report.chunks, requests.len());
    assert_eq!(events.count("chunk_start"), requests.len());
    assert_eq!(events.count("chunk_complete"), requests.len());

    let indices: Vec<usize> = report.metrics.iter().map(|m| m.chunk_index).collect();
    assert_eq!(indices, (0..requests.len()).collect::<Vec<_>>());
    for m in &report.metrics {
        assert!(m.request_start_ms <= m.first_frame_ms);
        assert!(m.first_frame_ms <= m.chunk_complete_ms);
    }
}

#[tokio::test]
async fn test_transient_failure_retried_once_without_replaying_audio() {
    let dir = TempDir::new().unwrap();
    let cache = PhraseCache::new(dir.path(), Duration::from_secs(3600)).unwrap();
    let backend = Arc::new(ScriptedBackend::new(vec![
        Script::FailAfter {
            frames: 2,
            failure: Failure::Transient,
        },
        Script::Frames(5),
    ]));
    let events = Arc::new(RecordingEventSink::new());
    let sink = MemorySink::new();

    let report = controller(&backend, &events)
        .with_cache(cache.clone())
        .run("Retry me.", &mut fast_playback(&sink), &mut context(200), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(backend.connections(), 2);
    assert_eq!(events.count("retry"), 1);
    let retry = events
        .events()
        .into_iter()
        .find(|e| e.name() == "retry")
        .unwrap();
    match retry {
        PipelineEvent::Retry {
            attempt,
            kind,
            skipped_bytes,
            delay_ms,
            ..
        } => {
            assert_eq!(attempt, 1);
            assert_eq!(kind, FailureKind::NetworkTransient);
            assert_eq!(skipped_bytes, 2 * FRAME_BYTES);
            assert_eq!(delay_ms, 0);
        }
        other => panic!("unexpected event {other:?}"),
    }

    // Nothing heard twice, nothing lost.
    assert_eq!(audible(&sink), frames_audio(0..5));
    assert_eq!(report.bytes_submitted, 5 * FRAME_BYTES);
    assert_eq!(report.metrics[0].attempts, 2);

    // The cache holds the complete successful attempt.
    let key = tts_core::key_for(&SynthesisSettings::default(), "Retry me.");
    assert_eq!(cache.lookup(&key).unwrap().pcm, frames_audio(0..5));
}

#[tokio::test]
async fn test_auth_failure_is_not_retried() {
    let backend = Arc::new(ScriptedBackend::new(vec![Script::FailConnect(Failure::Auth)]));
    let events = Arc::new(RecordingEventSink::new());
    let sink = MemorySink::new();

    let err = controller(&backend, &events)
        .run("Secret.", &mut fast_playback(&sink), &mut context(200), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, StreamError::Auth(_)));
    assert_eq!(backend.connections(), 1);
    assert_eq!(events.count("retry"), 0);
    assert_eq!(events.count("error"), 1);
    assert!(sink.is_closed());
}

#[tokio::test]
async fn test_rate_limit_backs_off_then_succeeds() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Script::FailConnect(Failure::RateLimit),
        Script::FailConnect(Failure::RateLimit),
        Script::Frames(3),
    ]));
    let events = Arc::new(RecordingEventSink::new());
    let sink = MemorySink::new();

    let report = controller(&backend, &events)
        .run("Busy.", &mut fast_playback(&sink), &mut context(200), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(backend.connections(), 3);
    let delays: Vec<u64> = events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            PipelineEvent::Retry { delay_ms, .. } => Some(delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![10, 20]);
    assert_eq!(report.network_attempts, 3);
}

#[tokio::test]
async fn test_rate_limit_exhaustion_surfaces_last_failure() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Script::FailConnect(Failure::RateLimit),
        Script::FailConnect(Failure::RateLimit),
        Script::FailConnect(Failure::RateLimit),
    ]));
    let events = Arc::new(RecordingEventSink::new());
    let sink = MemorySink::new();

    let err = controller(&backend, &events)
        .run("Busy.", &mut fast_playback(&sink), &mut context(200), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::RateLimit { .. }));
    assert_eq!(backend.connections(), 3);
    assert_eq!(events.count("retry"), 2);
}

#[tokio::test]
async fn test_sequence_gap_is_protocol_error() {
    let dir = TempDir::new().unwrap();
    let cache = PhraseCache::new(dir.path(), Duration::from_secs(3600)).unwrap();
    let backend = Arc::new(ScriptedBackend::new(vec![Script::Gap]));
    let events = Arc::new(RecordingEventSink::new());
    let sink = MemorySink::new();

    let err = controller(&backend, &events)
        .with_cache(cache.clone())
        .run("Gappy.", &mut fast_playback(&sink), &mut context(200), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, StreamError::ProtocolMalformed(_)));
    assert_eq!(err.kind(), FailureKind::ProtocolMalformed);
    assert_eq!(backend.connections(), 1, "protocol errors fail fast");
    assert!(cache.is_empty(), "partial streams never reach the cache");
    assert!(sink.is_closed());
}

#[tokio::test]
async fn test_sequence_number_overflow_is_protocol_error() {
    let backend = Arc::new(ScriptedBackend::new(vec![Script::NumberedFrom {
        first: u64::MAX,
        frames: 2,
    }]));
    let events = Arc::new(RecordingEventSink::new());
    let sink = MemorySink::new();

    let err = controller(&backend, &events)
        .run("Overflow.", &mut fast_playback(&sink), &mut context(200), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::ProtocolMalformed);
    assert_eq!(backend.connections(), 1, "protocol errors fail fast");
    assert_eq!(events.count("error"), 1);
}

#[tokio::test]
async fn test_final_frame_at_highest_sequence_number_completes() {
    let backend = Arc::new(ScriptedBackend::new(vec![Script::NumberedFrom {
        first: u64::MAX - 1,
        frames: 2,
    }]));
    let events = Arc::new(RecordingEventSink::new());
    let sink = MemorySink::new();

    let report = controller(&backend, &events)
        .run("Edge.", &mut fast_playback(&sink), &mut context(200), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(audible(&sink), frames_audio(0..2));
}

#[tokio::test]
async fn test_starved_playback_raises_next_prebuffer() {
    // 150 ms between frames outlasts the 80 ms played after the start.
    let backend = Arc::new(
        ScriptedBackend::new(vec![Script::Frames(5)]).with_frame_delay(Duration::from_millis(150)),
    );
    let events = Arc::new(RecordingEventSink::new());
    let sink = MemorySink::new();
    let mut ctx = context(200);

    let mut playback = realtime_playback(&sink, ctx.prebuffer_ms);
    let report = controller(&backend, &events)
        .run("Starve.", &mut playback, &mut ctx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.playback.underrun_count, 1);
    assert_eq!(events.count("underrun"), 1);
    assert_eq!(ctx.prebuffer_ms, 100);
    assert_eq!(audible(&sink), frames_audio(0..5));
}

#[tokio::test]
async fn test_prebuffer_growth_stops_at_ceiling() {
    // Each run starts once its prebuffer is full, then waits 300 ms for the
    // last frame, longer than any prebuffer can cover.
    let backend = Arc::new(
        ScriptedBackend::new(vec![Script::Frames(10), Script::Frames(11)])
            .with_frame_delay(Duration::from_millis(300)),
    );
    let events = Arc::new(RecordingEventSink::new());
    let speaker = controller(&backend, &events);
    let mut ctx = RunContext::new(200, 180, AdaptivePolicy::default());

    for run in 0..2 {
        let sink = MemorySink::new();
        let mut playback = realtime_playback(&sink, ctx.prebuffer_ms);
        let report = speaker
            .run("Starve again.", &mut playback, &mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.playback.underrun_count, 1, "run {run}");
        assert_eq!(ctx.prebuffer_ms, MAX_PREBUFFER_MS, "run {run}");
    }
    assert_eq!(events.count("underrun"), 2);
}

#[tokio::test]
async fn test_interrupt_mid_second_chunk_keeps_partial_audio() {
    let dir = TempDir::new().unwrap();
    let cache = PhraseCache::new(dir.path().join("cache"), Duration::from_secs(3600)).unwrap();
    let wav_path = dir.path().join("out.wav");
    let backend = Arc::new(ScriptedBackend::new(vec![
        Script::Frames(5),
        Script::Stall { frames: 2 },
    ]));
    let events = Arc::new(RecordingEventSink::new());
    let sink = MemorySink::new();
    let mut playback = fast_playback(&sink).with_capture(WavCapture::new(&wav_path));

    let cancel = CancellationToken::new();
    let trigger = {
        let paused = backend.paused.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            paused.notified().await;
            cancel.cancel();
        })
    };

    let report = controller(&backend, &events)
        .with_cache(cache.clone())
        .run(
            "First sentence. Second sentence. Third sentence.",
            &mut playback,
            &mut context(20),
            &cancel,
        )
        .await
        .unwrap();
    trigger.await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Interrupted { chunk: 1 });
    assert_eq!(backend.connections(), 2, "third chunk never requested");
    assert_eq!(events.count("interrupt"), 1);
    assert!(sink.is_closed());

    let mut expected = frames_audio(0..5);
    expected.extend(frames_audio(0..2));
    assert_eq!(audible(&sink), expected);

    let capture = report.playback.capture.expect("capture finalized");
    assert!(capture.ok);
    assert_eq!(capture.bytes_written as usize, 7 * FRAME_BYTES);
    let reader = hound::WavReader::open(&wav_path).unwrap();
    assert_eq!(reader.len() as usize, 7 * FRAME_BYTES / 2);

    assert_eq!(cache.len(), 1, "only the completed chunk is cached");
}

#[tokio::test]
async fn test_cancel_before_start_plays_nothing() {
    let backend = Arc::new(ScriptedBackend::new(vec![]));
    let events = Arc::new(RecordingEventSink::new());
    let sink = MemorySink::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = controller(&backend, &events)
        .run("Never spoken.", &mut fast_playback(&sink), &mut context(200), &cancel)
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Interrupted { chunk: 0 });
    assert_eq!(backend.connections(), 0);
    assert!(sink.bytes().is_empty());
}

#[tokio::test]
async fn test_empty_text_fails_before_network() {
    let backend = Arc::new(ScriptedBackend::new(vec![]));
    let events = Arc::new(RecordingEventSink::new());
    let sink = MemorySink::new();

    let err = controller(&backend, &events)
        .run("  \n\t ", &mut fast_playback(&sink), &mut context(200), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::Validation(_)));
    assert_eq!(backend.connections(), 0);
    assert_eq!(sink.open_attempts(), 0);
}

#[tokio::test]
async fn test_invalid_settings_fail_before_network() {
    let backend = Arc::new(ScriptedBackend::new(vec![]));
    let settings = SynthesisSettings {
        stability: 2.0,
        ..SynthesisSettings::default()
    };
    let sink = MemorySink::new();
    let err = StreamingController::new(backend.clone(), settings, quick_options())
        .run("Hi.", &mut fast_playback(&sink), &mut context(200), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::Validation(_)));
    assert_eq!(backend.connections(), 0);
}

#[tokio::test]
async fn test_unchunked_run_sends_whole_text() {
    let backend = Arc::new(ScriptedBackend::new(vec![]));
    let sink = MemorySink::new();
    let options = tts_core::ControllerOptions {
        chunking: false,
        ..quick_options()
    };
    let text = "One sentence.   Another sentence that is long enough to matter here.";
    StreamingController::new(backend.clone(), SynthesisSettings::default(), options)
        .with_events(Arc::new(RecordingEventSink::new()))
        .run(text, &mut fast_playback(&sink), &mut context(10), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(backend.requests(), vec![normalize_whitespace(text)]);
}

#[tokio::test]
async fn test_slow_backend_shrinks_later_chunks() {
    let backend = Arc::new(ScriptedBackend::new(vec![]).with_frame_delay(Duration::from_millis(30)));
    let events = Arc::new(RecordingEventSink::new());
    let sink = MemorySink::new();
    let mut ctx = RunContext::new(
        100,
        80,
        AdaptivePolicy {
            latency_threshold_ms: 5.0,
            adapt_every: 2,
            min_chars: 20,
            shrink_factor: 0.8,
        },
    );
    let text = "Alpha beta gamma. Delta epsilon zeta. Eta theta iota. Kappa lambda mu.";

    controller(&backend, &events)
        .run(text, &mut fast_playback(&sink), &mut ctx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(events.count("adaptive_chunk"), 2);
    assert_eq!(ctx.max_chars, 64);
    assert_eq!(ctx.metrics().len(), 4);
}
