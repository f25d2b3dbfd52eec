//! Error types for the voice session core.

use serde::{Deserialize, Serialize};

/// Top-level error type for the voice session core.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Audio device or stream error (capture or output).
    #[error("device error: {0}")]
    Device(String),

    /// Connection refused, dropped, or handshake failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed base64 or PCM payload.
    #[error("decode error: {0}")]
    Decode(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Normalize into the closed set of kinds consumers are allowed to see.
    ///
    /// Configuration and I/O errors only occur before a session runs, so they
    /// have no consumer-facing kind.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Device(_) => Some(ErrorKind::Device),
            Self::Transport(_) | Self::Channel(_) => Some(ErrorKind::Transport),
            Self::Decode(_) => Some(ErrorKind::Decode),
            Self::Config(_) | Self::Io(_) => None,
        }
    }
}

/// Error categories delivered through `SessionObserver::on_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The connection to the voice service failed or dropped.
    Transport,
    /// An inbound payload could not be decoded.
    Decode,
    /// An audio device could not be opened or stopped working.
    Device,
    /// The fallback timer expired before any audio arrived.
    Timeout,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Transport => "transport",
            Self::Decode => "decode",
            Self::Device => "device",
            Self::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;
