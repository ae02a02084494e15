//! ElevenLabs HTTP streaming backend. The response body is raw PCM16 which is
//! re-framed into fixed-length frames; the last frame carries `is_final`.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::Client;
use tracing::{debug, trace};
use tts_core::settings::bytes_for_ms;
use tts_core::{Backend, BackendMessage, Connection, Result, StreamError, SynthesisRequest};

use crate::protocol::{
    append_stream_query, classify_status, http_body, parse_retry_after, tts_url, API_KEY_HEADER,
    DEFAULT_API_BASE,
};

pub const FRAME_MS: u32 = 200;

#[derive(Debug, Clone)]
pub struct ElevenLabsHttpBackend {
    client: Client,
    api_key: String,
    api_base: String,
    sample_rate: u32,
}

impl ElevenLabsHttpBackend {
    pub fn new(api_key: impl Into<String>, sample_rate: u32) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| StreamError::network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            sample_rate,
        })
    }

    pub fn with_base_url(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

pub(crate) fn map_reqwest_error(err: reqwest::Error) -> StreamError {
    if err.is_decode() {
        StreamError::malformed(err.to_string())
    } else if err.is_builder() {
        StreamError::validation(err.to_string())
    } else {
        StreamError::network(err.to_string())
    }
}

/// Cuts an arbitrary byte stream into `frame_bytes` frames, holding back the
/// tail so the final frame can be flagged.
#[derive(Debug)]
pub(crate) struct Reframer {
    frame_bytes: usize,
    buffer: Vec<u8>,
    emitted: usize,
}

impl Reframer {
    pub(crate) fn new(frame_bytes: usize) -> Self {
        Self {
            frame_bytes: frame_bytes.max(2),
            buffer: Vec::new(),
            emitted: 0,
        }
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// A full frame, provided more bytes are known to follow it.
    pub(crate) fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buffer.len() <= self.frame_bytes {
            return None;
        }
        let frame: Vec<u8> = self.buffer.drain(..self.frame_bytes).collect();
        self.emitted += 1;
        Some(frame)
    }

    /// The remaining bytes once the body has ended. A trailing odd byte is
    /// dropped.
    pub(crate) fn finish(&mut self) -> Result<Vec<u8>> {
        let mut rest = std::mem::take(&mut self.buffer);
        if rest.len() % 2 != 0 {
            rest.pop();
        }
        if rest.is_empty() && self.emitted == 0 {
            return Err(StreamError::malformed("backend returned an empty audio stream"));
        }
        self.emitted += 1;
        Ok(rest)
    }
}

struct HttpConnection {
    client: Client,
    api_key: String,
    api_base: String,
    sample_rate: u32,
    body: Option<BoxStream<'static, reqwest::Result<Vec<u8>>>>,
    reframer: Reframer,
    finished: bool,
}

#[async_trait]
impl Connection for HttpConnection {
    async fn send(&mut self, request: &SynthesisRequest) -> Result<()> {
        let settings = &request.settings;
        let mut url = tts_url(&self.api_base, &settings.voice_id, "stream")?;
        append_stream_query(&mut url, settings, self.sample_rate, false);

        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .header(ACCEPT, "application/octet-stream")
            .json(&http_body(&request.text, settings))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            );
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), retry_after, &detail));
        }

        trace!(chunk = request.chunk_index, status = status.as_u16(), "streaming response body");
        self.body = Some(
            response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
                .boxed(),
        );
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<BackendMessage>> {
        if self.finished {
            return Ok(None);
        }
        let Some(body) = self.body.as_mut() else {
            return Err(StreamError::validation("request not sent"));
        };

        loop {
            if let Some(frame) = self.reframer.next_frame() {
                return Ok(Some(BackendMessage::audio(frame)));
            }
            match body.next().await {
                Some(Ok(bytes)) => self.reframer.push(&bytes),
                Some(Err(e)) => return Err(map_reqwest_error(e)),
                None => {
                    self.finished = true;
                    let rest = self.reframer.finish()?;
                    return Ok(Some(BackendMessage::last(rest)));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.finished = true;
        self.body = None;
        Ok(())
    }
}

#[async_trait]
impl Backend for ElevenLabsHttpBackend {
    fn name(&self) -> &str {
        "elevenlabs-http"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn connect(&self, request: &SynthesisRequest) -> Result<Box<dyn Connection>> {
        debug!(chunk = request.chunk_index, voice = %request.settings.voice_id, "opening http stream");
        Ok(Box::new(HttpConnection {
            client: self.client.clone(),
            api_key: self.api_key.clone(),
            api_base: self.api_base.clone(),
            sample_rate: self.sample_rate,
            body: None,
            reframer: Reframer::new(bytes_for_ms(FRAME_MS, self.sample_rate)),
            finished: false,
        }))
    }
}
