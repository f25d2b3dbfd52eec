//! Wire protocol of the realtime voice service.
//!
//! Every message is a JSON object whose `type` field names the event. Only
//! the events the session acts on are modelled; anything else deserializes
//! to [`ServerEvent::Unknown`].

use crate::config::SessionConfig;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Messages sent from the session to the service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Configure the remote session. Sent once after the socket opens.
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionPayload },
    /// Ask the service to start speaking.
    #[serde(rename = "response.create")]
    ResponseCreate,
    /// Abandon the response currently being generated.
    #[serde(rename = "response.cancel")]
    ResponseCancel,
    /// Append one captured frame to the server's input buffer.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },
}

impl ClientEvent {
    /// Serialize for the socket.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Session parameters carried by `session.update`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionPayload {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub turn_detection: TurnDetection,
}

impl From<&SessionConfig> for SessionPayload {
    fn from(config: &SessionConfig) -> Self {
        Self {
            modalities: vec!["audio".to_owned(), "text".to_owned()],
            instructions: config.instructions.clone(),
            voice: config.voice.clone(),
            input_audio_format: config.input_audio_format.clone(),
            output_audio_format: config.output_audio_format.clone(),
            turn_detection: TurnDetection {
                kind: config.turn_detection.kind.clone(),
                threshold: config.turn_detection.threshold,
                prefix_padding_ms: config.turn_detection.prefix_padding_ms,
                silence_duration_ms: config.turn_detection.silence_duration_ms,
            },
        }
    }
}

/// Server-side voice activity detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Messages received from the service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {},
    #[serde(rename = "session.updated")]
    SessionUpdated {},
    /// One chunk of synthesized speech.
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },
    /// The response finished, was cancelled, or failed.
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: Option<ResponseInfo>,
    },
    /// Server-side VAD detected the user talking.
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {},
    /// Server-side VAD decided the user finished their turn.
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {},
    #[serde(rename = "error")]
    Error { error: RemoteError },
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Parse one text frame.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Error body reported by the service.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct RemoteError {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = self.kind.as_deref().unwrap_or("error");
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => write!(f, "{kind} ({code}): {message}"),
            (None, Some(message)) => write!(f, "{kind}: {message}"),
            (Some(code), None) => write!(f, "{kind} ({code})"),
            (None, None) => f.write_str(kind),
        }
    }
}
