//! One streaming request/response exchange with a synthesis backend.
//!
//! Backends implement [`Backend`] and hand out one [`Connection`] per
//! session. [`SynthesisSession`] drives the connection through
//! `Idle -> Connecting -> Sending -> Receiving -> Finalized` (or `Failed`) and
//! bounds every wait on the remote side with the configured timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::error::{Result, StreamError};
use crate::settings::{AudioFrame, SynthesisSettings};

/// Everything a backend needs to synthesize one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub chunk_index: usize,
    pub text: String,
    pub settings: SynthesisSettings,
    pub sample_rate: u32,
}

/// One decoded message from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendMessage {
    pub pcm: Vec<u8>,
    pub is_final: bool,
    /// Backends that number their frames report it here; otherwise the
    /// session numbers frames in arrival order.
    pub sequence_no: Option<u64>,
}

impl BackendMessage {
    pub fn audio(pcm: Vec<u8>) -> Self {
        Self {
            pcm,
            is_final: false,
            sequence_no: None,
        }
    }

    pub fn last(pcm: Vec<u8>) -> Self {
        Self {
            pcm,
            is_final: true,
            sequence_no: None,
        }
    }
}

/// An open duplex exchange for one chunk.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, request: &SynthesisRequest) -> Result<()>;

    /// `Ok(None)` means the remote side closed the stream.
    async fn recv(&mut self) -> Result<Option<BackendMessage>>;

    async fn close(&mut self) -> Result<()>;
}

/// A synthesis provider. One implementation per remote service.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Sample rate of the PCM16 this backend produces.
    fn sample_rate(&self) -> u32;

    async fn connect(&self, request: &SynthesisRequest) -> Result<Box<dyn Connection>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Sending,
    Receiving,
    Finalized,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Finalized | SessionState::Failed)
    }
}

/// Single-use; retries open a fresh session.
pub struct SynthesisSession {
    backend: Arc<dyn Backend>,
    request: SynthesisRequest,
    timeout: Duration,
    state: SessionState,
    conn: Option<Box<dyn Connection>>,
    next_seq: u64,
}

impl SynthesisSession {
    pub fn new(backend: Arc<dyn Backend>, request: SynthesisRequest, timeout: Duration) -> Self {
        Self {
            backend,
            request,
            timeout,
            state: SessionState::Idle,
            conn: None,
            next_seq: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn request(&self) -> &SynthesisRequest {
        &self.request
    }

    /// Connect and send the chunk. On return the session is `Receiving`.
    pub async fn open(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(StreamError::validation("synthesis session is single-use"));
        }

        self.state = SessionState::Connecting;
        let backend = Arc::clone(&self.backend);
        let connected = bounded(self.timeout, backend.connect(&self.request)).await;
        let conn = match connected {
            Ok(conn) => self.conn.insert(conn),
            Err(e) => return Err(self.fail(e).await),
        };

        self.state = SessionState::Sending;
        trace!(chunk = self.request.chunk_index, backend = backend.name(), "sending request");
        let sent = bounded(self.timeout, conn.send(&self.request)).await;
        if let Err(e) = sent {
            return Err(self.fail(e).await);
        }

        self.state = SessionState::Receiving;
        Ok(())
    }

    /// Wait for the next frame. `Ok(None)` once the session is finalized.
    pub async fn next_frame(&mut self) -> Result<Option<AudioFrame>> {
        match self.state {
            SessionState::Receiving => {}
            SessionState::Finalized => return Ok(None),
            SessionState::Failed => {
                return Err(StreamError::network("synthesis session already failed"))
            }
            _ => return Err(StreamError::validation("synthesis session is not open")),
        }

        let Some(conn) = self.conn.as_mut() else {
            return Err(self.fail(StreamError::network("connection released")).await);
        };
        let received = bounded(self.timeout, conn.recv()).await;
        let message = match received {
            Ok(Some(message)) => message,
            Ok(None) => {
                let err = StreamError::network("stream ended before final frame");
                return Err(self.fail(err).await);
            }
            Err(e) => return Err(self.fail(e).await),
        };

        if message.pcm.len() % 2 != 0 {
            let err = StreamError::malformed(format!(
                "odd PCM16 payload length {}",
                message.pcm.len()
            ));
            return Err(self.fail(err).await);
        }

        let sequence_no = message.sequence_no.unwrap_or(self.next_seq);
        self.next_seq = sequence_no.saturating_add(1);
        let frame = AudioFrame::new(
            message.pcm,
            self.backend.sample_rate(),
            sequence_no,
            message.is_final,
        );

        if frame.is_final {
            self.state = SessionState::Finalized;
            self.release().await;
        }
        Ok(Some(frame))
    }

    /// Release the connection. Safe from any state and safe to repeat.
    pub async fn close(&mut self) {
        self.release().await;
    }

    async fn fail(&mut self, err: StreamError) -> StreamError {
        debug!(
            chunk = self.request.chunk_index,
            state = ?self.state,
            error = %err,
            "synthesis session failed"
        );
        self.state = SessionState::Failed;
        self.release().await;
        err
    }

    async fn release(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = bounded(self.timeout, conn.close()).await {
                debug!(chunk = self.request.chunk_index, error = %e, "error closing connection");
            }
        }
    }
}

/// Bound a remote wait; expiry counts as a transient network failure.
async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StreamError::timeout(limit)),
    }
}
