//! ElevenLabs `stream-input` WebSocket backend.
//!
//! One socket per chunk: the chunk text goes out in a single message together
//! with the voice settings, followed by the empty end-of-stream message. The
//! server answers with JSON messages carrying base64 PCM16 in `audio` and a
//! final message flagged `isFinal`.

use async_trait::async_trait;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use tts_core::{Backend, BackendMessage, Connection, Result, StreamError, SynthesisRequest};

use crate::protocol::{
    append_stream_query, classify_message, classify_status, parse_retry_after, tts_url,
    VoiceSettings, API_KEY_HEADER, DEFAULT_WS_BASE,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const END_OF_STREAM: &str = r#"{"text":""}"#;

#[derive(Debug, Clone)]
pub struct ElevenLabsWsBackend {
    api_key: String,
    ws_base: String,
    sample_rate: u32,
}

impl ElevenLabsWsBackend {
    pub fn new(api_key: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            api_key: api_key.into(),
            ws_base: DEFAULT_WS_BASE.to_string(),
            sample_rate,
        }
    }

    /// Point at another server (tests, proxies).
    pub fn with_base_url(mut self, ws_base: impl Into<String>) -> Self {
        self.ws_base = ws_base.into();
        self
    }
}

/// Server message. Audio and error payloads share the channel.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    audio: Option<String>,
    #[serde(default)]
    is_final: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn map_ws_error(err: tungstenite::Error) -> StreamError {
    match err {
        tungstenite::Error::Http(response) => {
            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok()),
            );
            classify_status(response.status().as_u16(), retry_after, "")
        }
        tungstenite::Error::Url(e) => StreamError::validation(format!("invalid websocket url: {e}")),
        tungstenite::Error::Protocol(e) => StreamError::network(format!("websocket protocol: {e}")),
        other => StreamError::network(other.to_string()),
    }
}

fn decode_message(text: &str) -> Result<Option<BackendMessage>> {
    let parsed: ServerMessage = serde_json::from_str(text)
        .map_err(|e| StreamError::malformed(format!("undecodable server message: {e}")))?;

    let audio = parsed.audio.filter(|a| !a.is_empty());
    if audio.is_none() {
        let reason: Vec<String> = parsed.error.into_iter().chain(parsed.message).collect();
        if !reason.is_empty() {
            return Err(classify_message(&reason.join(": ")));
        }
    }

    let pcm = match audio {
        Some(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| StreamError::malformed(format!("invalid base64 audio: {e}")))?,
        None => Vec::new(),
    };
    let is_final = parsed.is_final.unwrap_or(false);
    if pcm.is_empty() && !is_final {
        // Alignment-only or keepalive message.
        return Ok(None);
    }
    Ok(Some(BackendMessage {
        pcm,
        is_final,
        sequence_no: None,
    }))
}

struct WsConnection {
    socket: Socket,
    api_key: String,
    finished: bool,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, request: &SynthesisRequest) -> Result<()> {
        let opening = json!({
            // A trailing space tells the server the text is complete.
            "text": format!("{} ", request.text),
            "voice_settings": VoiceSettings::from(&request.settings),
            "generation_config": { "chunk_length_schedule": [50] },
            "xi_api_key": self.api_key,
        });
        self.socket
            .send(Message::text(opening.to_string()))
            .await
            .map_err(map_ws_error)?;
        self.socket
            .send(Message::text(END_OF_STREAM))
            .await
            .map_err(map_ws_error)?;
        trace!(chunk = request.chunk_index, "sent chunk over websocket");
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<BackendMessage>> {
        if self.finished {
            return Ok(None);
        }
        while let Some(message) = self.socket.next().await {
            match message.map_err(map_ws_error)? {
                Message::Text(text) => {
                    if let Some(decoded) = decode_message(text.as_str())? {
                        self.finished = decoded.is_final;
                        return Ok(Some(decoded));
                    }
                }
                Message::Binary(_) => {
                    return Err(StreamError::malformed("unexpected binary websocket message"));
                }
                Message::Close(frame) => {
                    self.finished = true;
                    if let Some(frame) = frame {
                        if frame.code != CloseCode::Normal && !frame.reason.is_empty() {
                            return Err(classify_message(frame.reason.as_str()));
                        }
                    }
                    return Ok(None);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
        self.finished = true;
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        self.finished = true;
        match self.socket.close(None).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => {
                debug!(error = %e, "websocket close failed");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Backend for ElevenLabsWsBackend {
    fn name(&self) -> &str {
        "elevenlabs-websocket"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn connect(&self, request: &SynthesisRequest) -> Result<Box<dyn Connection>> {
        let mut url = tts_url(&self.ws_base, &request.settings.voice_id, "stream-input")?;
        append_stream_query(&mut url, &request.settings, self.sample_rate, true);

        let mut handshake = url
            .as_str()
            .into_client_request()
            .map_err(map_ws_error)?;
        let key = HeaderValue::from_str(&self.api_key)
            .map_err(|_| StreamError::Auth("API key contains invalid characters".into()))?;
        handshake.headers_mut().insert(API_KEY_HEADER, key);

        debug!(chunk = request.chunk_index, voice = %request.settings.voice_id, "opening websocket");
        let (socket, _) = connect_async(handshake).await.map_err(map_ws_error)?;
        Ok(Box::new(WsConnection {
            socket,
            api_key: self.api_key.clone(),
            finished: false,
        }))
    }
}
