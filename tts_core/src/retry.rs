//! Bounded retry around synthesis sessions.
//!
//! [`RetryPolicy::execute`] opens sessions through a caller-supplied factory
//! and yields [`Attempt`] events: every frame as it arrives, and a
//! `Retrying` marker between attempts. The stream ends after the final frame,
//! after cancellation, or with the last classified failure.

use std::time::Duration;

use futures::Stream;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{FailureKind, Result, StreamError};
use crate::session::SynthesisSession;
use crate::settings::AudioFrame;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first one included.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    /// Upper bound of random jitter added to rate-limit backoff.
    pub jitter_ms: u64,
    /// Ceiling for any single backoff, server hints included.
    pub max_backoff: Duration,
}

pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(300),
            jitter_ms: 0,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

#[derive(Debug)]
pub enum Attempt {
    Frame {
        attempt: u32,
        frame: AudioFrame,
    },
    /// `attempt` failed; attempt `attempt + 1` starts after `delay`.
    Retrying {
        attempt: u32,
        delay: Duration,
        kind: FailureKind,
        message: String,
    },
    Cancelled,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
            jitter_ms: 0,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_jitter(mut self, jitter_ms: u64) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }

    /// Exponential backoff for rate limits: `base * 2^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1u32 << exp).min(self.max_backoff)
    }

    /// Whether `error` from attempt number `attempt` (1-based) is worth another
    /// try. `transient_retries` counts retries already spent on network failures.
    pub fn decide(&self, error: &StreamError, attempt: u32, transient_retries: u32) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        match error {
            StreamError::RateLimit { retry_after } => {
                let mut delay = self.backoff(attempt);
                if let Some(hint) = retry_after {
                    delay = delay.max((*hint).min(self.max_backoff));
                }
                if self.jitter_ms > 0 {
                    delay += Duration::from_millis(rand::thread_rng().gen_range(0..=self.jitter_ms));
                }
                RetryDecision::Retry(delay)
            }
            StreamError::NetworkTransient(_) if transient_retries == 0 => {
                RetryDecision::Retry(Duration::ZERO)
            }
            _ => RetryDecision::GiveUp,
        }
    }

    /// Run sessions from `open_session(attempt)` until one reaches its final
    /// frame. Cancellation is observed while opening, between frames and
    /// during backoff; the active session is closed before `Cancelled` is
    /// yielded.
    pub fn execute<'a, F>(
        &self,
        mut open_session: F,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<Attempt>> + Send + 'a
    where
        F: FnMut(u32) -> SynthesisSession + Send + 'a,
    {
        let policy = self.clone();
        async_stream::stream! {
            let mut attempt: u32 = 1;
            let mut transient_retries: u32 = 0;
            loop {
                let mut session = open_session(attempt);

                let opened = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    r = session.open() => Some(r),
                };
                let failure = match opened {
                    None => {
                        session.close().await;
                        yield Ok(Attempt::Cancelled);
                        return;
                    }
                    Some(Err(e)) => e,
                    Some(Ok(())) => loop {
                        let next = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            r = session.next_frame() => Some(r),
                        };
                        match next {
                            None => {
                                session.close().await;
                                yield Ok(Attempt::Cancelled);
                                return;
                            }
                            Some(Ok(Some(frame))) => {
                                let is_final = frame.is_final;
                                yield Ok(Attempt::Frame { attempt, frame });
                                if is_final {
                                    return;
                                }
                            }
                            Some(Ok(None)) => return,
                            Some(Err(e)) => break e,
                        }
                    },
                };
                session.close().await;

                let delay = match policy.decide(&failure, attempt, transient_retries) {
                    RetryDecision::Retry(delay) => delay,
                    RetryDecision::GiveUp => {
                        debug!(attempt, kind = ?failure.kind(), "giving up on chunk");
                        yield Err(failure);
                        return;
                    }
                };
                if failure.kind() == FailureKind::NetworkTransient {
                    transient_retries += 1;
                }

                info!(attempt, delay_ms = delay.as_millis() as u64, error = %failure, "retrying synthesis");
                yield Ok(Attempt::Retrying {
                    attempt,
                    delay,
                    kind: failure.kind(),
                    message: failure.to_string(),
                });

                if !delay.is_zero() {
                    let interrupted = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if interrupted {
                        yield Ok(Attempt::Cancelled);
                        return;
                    }
                }
                attempt += 1;
            }
        }
    }
}
