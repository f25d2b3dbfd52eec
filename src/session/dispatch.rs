//! Demultiplexes inbound protocol text into the streams the session acts on.

use crate::pipeline::messages::InboundAudioChunk;
use crate::session::protocol::{RemoteError, ServerEvent};
use crate::session::state::SessionEvent;
use tracing::{debug, trace, warn};

/// One inbound message, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    AudioDelta(InboundAudioChunk),
    TurnComplete { response_id: Option<String> },
    SpeechStarted,
    SpeechStopped,
    Error(RemoteError),
    /// Parsed fine but carries nothing the session needs.
    Ignored,
}

impl Inbound {
    /// The state machine input for this message, if any.
    ///
    /// Remote `error` events are reported but not fatal; the service keeps
    /// the socket open and the session keeps its state.
    pub fn session_event(&self) -> Option<SessionEvent> {
        match self {
            Self::AudioDelta(chunk) => Some(SessionEvent::AudioDelta {
                response_id: chunk.response_id.clone(),
            }),
            Self::TurnComplete { response_id } => Some(SessionEvent::TurnComplete {
                response_id: response_id.clone(),
            }),
            Self::SpeechStarted => Some(SessionEvent::UserSpeechStarted),
            Self::SpeechStopped => Some(SessionEvent::UserSpeechStopped),
            Self::Error(_) | Self::Ignored => None,
        }
    }
}

/// Classify one text frame from the transport.
///
/// Frames that fail to parse are logged and ignored; they never end the
/// session.
pub fn dispatch(text: &str) -> Inbound {
    let event = match ServerEvent::from_json(text) {
        Ok(event) => event,
        Err(e) => {
            warn!("unparseable server message: {e}");
            return Inbound::Ignored;
        }
    };

    match event {
        ServerEvent::AudioDelta { response_id, delta } => {
            trace!(bytes = delta.len(), "audio delta");
            Inbound::AudioDelta(InboundAudioChunk {
                response_id,
                payload: delta,
            })
        }
        ServerEvent::ResponseDone { response } => {
            let (response_id, status) = response
                .map(|r| (r.id, r.status))
                .unwrap_or((None, None));
            debug!(?response_id, ?status, "response done");
            Inbound::TurnComplete { response_id }
        }
        ServerEvent::SpeechStarted {} => Inbound::SpeechStarted,
        ServerEvent::SpeechStopped {} => Inbound::SpeechStopped,
        ServerEvent::Error { error } => {
            warn!("voice service reported an error: {error}");
            Inbound::Error(error)
        }
        ServerEvent::SessionCreated {} => {
            debug!("remote session created");
            Inbound::Ignored
        }
        ServerEvent::SessionUpdated {} => {
            debug!("remote session configured");
            Inbound::Ignored
        }
        ServerEvent::Unknown => {
            trace!("ignoring unhandled server event");
            Inbound::Ignored
        }
    }
}
