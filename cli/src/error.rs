use thiserror::Error;
use tts_core::{FailureKind, StreamError};

/// Failures surfaced by the binary, each with a process exit code.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("ELEVENLABS_API_KEY is not set (use --api-key, the environment, or --simulate)")]
    MissingApiKey,

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::InvalidInput(_) | CliError::Config(_) | CliError::MissingApiKey => 2,
            CliError::Stream(err) => match err.kind() {
                FailureKind::Validation | FailureKind::Auth => 2,
                FailureKind::RateLimit
                | FailureKind::NetworkTransient
                | FailureKind::ProtocolMalformed => 3,
                FailureKind::DeviceUnavailable => 4,
                FailureKind::Local => 1,
            },
            CliError::Other(_) => 1,
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Stream(StreamError::Io(err))
    }
}
