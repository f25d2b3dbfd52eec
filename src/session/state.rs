//! Session protocol state machine.
//!
//! [`SessionMachine::handle`] is a pure transition function: it never touches
//! a device, socket or timer. It returns the next state together with the
//! ordered [`Action`]s the driver must perform. Every (state, event) pair has
//! an outcome; pairs that do not apply come back as
//! [`Disposition::Ignored`] with a reason the driver logs.

use crate::error::ErrorKind;
use serde::Serialize;

/// Connection state of a voice session, pushed to observers on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    AwaitingResponse,
    Streaming,
    Closing,
    Errored,
}

impl ConnectionState {
    pub const ALL: [Self; 7] = [
        Self::Idle,
        Self::Connecting,
        Self::Open,
        Self::AwaitingResponse,
        Self::Streaming,
        Self::Closing,
        Self::Errored,
    ];

    /// Whether messages may be written to the transport in this state.
    pub fn transport_open(self) -> bool {
        matches!(self, Self::Open | Self::AwaitingResponse | Self::Streaming)
    }

    /// Whether inbound audio may still be scheduled in this state.
    pub fn accepts_audio(self) -> bool {
        !matches!(self, Self::Closing | Self::Errored)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::AwaitingResponse => "awaiting_response",
            Self::Streaming => "streaming",
            Self::Closing => "closing",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The consumer started the session.
    Start,
    /// The WebSocket handshake completed.
    TransportOpened,
    /// The delay after `session.update` elapsed.
    SettleElapsed,
    /// The service sent a chunk of speech.
    AudioDelta { response_id: Option<String> },
    /// Server-side VAD heard the user.
    UserSpeechStarted,
    /// Server-side VAD decided the user finished speaking.
    UserSpeechStopped,
    /// The service finished (or cancelled) a response.
    TurnComplete { response_id: Option<String> },
    /// The delay after turn completion elapsed.
    GraceElapsed,
    /// No audio arrived within the fallback window.
    FallbackExpired,
    /// A transport or device fault.
    Failed(ErrorKind),
    /// The consumer ended the session.
    Cancel,
    /// The transport is gone, locally or remotely.
    TransportClosed,
}

/// Side effects requested by a transition, performed in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    OpenTransport,
    SendSessionUpdate,
    StartCapture,
    ArmSettle,
    SendResponseCreate,
    ArmFallback,
    CancelFallback,
    /// Schedule the audio carried by the triggering event.
    SchedulePlayback,
    InterruptPlayback,
    SendResponseCancel,
    ArmGrace,
    StopCapture,
    /// Close the transport locally; a `TransportClosed` follows.
    CloseTransport,
    CancelTimers,
    /// Refuse all further audio and stop what is playing.
    HaltPlayback,
    /// Release every resource the session holds.
    Teardown,
    ReportError(ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    Ignored(&'static str),
}

/// Outcome of one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub actions: Vec<Action>,
    pub disposition: Disposition,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    pub fn has(&self, action: Action) -> bool {
        self.actions.contains(&action)
    }
}

/// The response that barge-in cut off, so its trailing audio and completion
/// can be recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Interrupted {
    response_id: Option<String>,
}

impl Interrupted {
    /// Events without ids, or interrupts of an unnamed response, match.
    fn matches(&self, response_id: Option<&str>) -> bool {
        match (self.response_id.as_deref(), response_id) {
            (Some(cut), Some(id)) => cut == id,
            _ => true,
        }
    }
}

/// Protocol state plus the little history transitions depend on.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: ConnectionState,
    response_requested: bool,
    turn_done: bool,
    /// The user is talking over a cut-off response; no fallback runs.
    user_turn: bool,
    current_response: Option<String>,
    interrupted: Option<Interrupted>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            response_requested: false,
            turn_done: false,
            user_turn: false,
            current_response: None,
            interrupted: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the service completed its turn and the session is winding down.
    pub fn turn_done(&self) -> bool {
        self.turn_done
    }

    /// Apply one event.
    pub fn handle(&mut self, event: SessionEvent) -> Transition {
        use Action::*;
        use ConnectionState as S;
        use SessionEvent as E;

        let from = self.state;
        let outcome = match (from, event) {
            // -- cancellation and faults, common to every live state --
            (S::Idle, E::Cancel) => Err("session is not running"),
            (S::Closing, E::Cancel) => Err("already closing"),
            (S::Closing, E::TransportClosed) => Ok((S::Idle, vec![])),
            (S::Closing, _) => Err("session is closing"),
            (_, E::Cancel) => Ok((S::Closing, vec![Teardown])),
            (S::Errored, E::TurnComplete { .. }) => Ok((S::Errored, vec![CloseTransport])),
            (S::Errored, E::AudioDelta { .. }) => Err("session failed, discarding audio"),
            (S::Errored, _) => Err("session already failed"),
            (S::Idle, E::Failed(_)) => Err("session is not running"),
            (_, E::Failed(kind)) => Ok((S::Errored, vec![Teardown, ReportError(kind)])),

            // -- idle --
            (S::Idle, E::Start) => {
                self.response_requested = false;
                self.turn_done = false;
                self.user_turn = false;
                self.current_response = None;
                self.interrupted = None;
                Ok((S::Connecting, vec![OpenTransport]))
            }
            (S::Idle, _) => Err("session is not running"),

            // -- connecting --
            (S::Connecting, E::TransportOpened) => {
                Ok((S::Open, vec![SendSessionUpdate, StartCapture, ArmSettle]))
            }
            (S::Connecting, E::TransportClosed) => Ok((
                S::Errored,
                vec![Teardown, ReportError(ErrorKind::Transport)],
            )),
            (S::Connecting, _) => Err("transport not open yet"),

            // -- open --
            (S::Open, E::SettleElapsed) if self.response_requested => {
                Err("response already requested")
            }
            (S::Open, E::SettleElapsed) => {
                self.response_requested = true;
                Ok((S::AwaitingResponse, vec![SendResponseCreate, ArmFallback]))
            }
            (S::Open, E::AudioDelta { .. }) if self.turn_done => {
                Err("turn complete, discarding audio")
            }
            (S::Open, E::AudioDelta { response_id }) => {
                // The service may answer on its own before the settle delay.
                self.response_requested = true;
                self.current_response = response_id;
                Ok((S::Streaming, vec![SchedulePlayback]))
            }
            (S::Open, E::UserSpeechStarted) => Ok((S::Open, vec![InterruptPlayback])),
            (S::Open, E::UserSpeechStopped) => Err("no response pending"),
            (S::Open, E::TurnComplete { response_id }) => {
                if self.take_interrupted(response_id.as_deref()) {
                    Ok((S::Open, vec![]))
                } else {
                    Err("no response in progress")
                }
            }
            (S::Open, E::GraceElapsed) if self.turn_done => {
                Ok((S::Open, vec![StopCapture, CloseTransport]))
            }
            (S::Open, E::GraceElapsed) => Err("turn not complete"),
            (S::Open, E::TransportClosed) if self.turn_done => Ok((S::Idle, vec![])),
            (S::Open, E::TransportClosed) => Ok((
                S::Errored,
                vec![Teardown, ReportError(ErrorKind::Transport)],
            )),
            (S::Open, E::FallbackExpired) => Err("no response pending"),
            (S::Open, _) => Err("transport already open"),

            // -- awaiting response --
            (S::AwaitingResponse, E::AudioDelta { ref response_id })
                if self.is_interrupted(response_id.as_deref()) =>
            {
                Err("audio from interrupted response")
            }
            (S::AwaitingResponse, E::AudioDelta { response_id }) => {
                self.interrupted = None;
                self.user_turn = false;
                self.current_response = response_id;
                Ok((S::Streaming, vec![CancelFallback, SchedulePlayback]))
            }
            (S::AwaitingResponse, E::TurnComplete { response_id }) => {
                if self.take_interrupted(response_id.as_deref()) {
                    Ok((S::AwaitingResponse, vec![]))
                } else {
                    self.turn_done = true;
                    self.user_turn = false;
                    Ok((S::Open, vec![CancelFallback, ArmGrace]))
                }
            }
            (S::AwaitingResponse, E::FallbackExpired) if self.user_turn => {
                Err("user is speaking")
            }
            (S::AwaitingResponse, E::FallbackExpired) => Ok((
                S::Errored,
                vec![
                    StopCapture,
                    CancelTimers,
                    HaltPlayback,
                    ReportError(ErrorKind::Timeout),
                ],
            )),
            (S::AwaitingResponse, E::TransportClosed) => Ok((
                S::Errored,
                vec![Teardown, ReportError(ErrorKind::Transport)],
            )),
            (S::AwaitingResponse, E::UserSpeechStarted) if self.user_turn => {
                Err("user already speaking")
            }
            (S::AwaitingResponse, E::UserSpeechStarted) => {
                // The service answers after the user's turn, not before.
                self.user_turn = true;
                Ok((S::AwaitingResponse, vec![CancelFallback]))
            }
            (S::AwaitingResponse, E::UserSpeechStopped) if self.user_turn => {
                self.user_turn = false;
                Ok((S::AwaitingResponse, vec![ArmFallback]))
            }
            (S::AwaitingResponse, E::UserSpeechStopped) => Err("user was not speaking"),
            (S::AwaitingResponse, _) => Err("waiting for the first audio delta"),

            // -- streaming --
            (S::Streaming, E::AudioDelta { .. }) => Ok((S::Streaming, vec![SchedulePlayback])),
            (S::Streaming, E::TurnComplete { .. }) => {
                self.turn_done = true;
                Ok((S::Open, vec![ArmGrace]))
            }
            (S::Streaming, E::UserSpeechStarted) => {
                self.interrupted = Some(Interrupted {
                    response_id: self.current_response.take(),
                });
                self.user_turn = true;
                Ok((
                    S::AwaitingResponse,
                    vec![InterruptPlayback, SendResponseCancel],
                ))
            }
            (S::Streaming, E::TransportClosed) => Ok((
                S::Errored,
                vec![Teardown, ReportError(ErrorKind::Transport)],
            )),
            (S::Streaming, E::FallbackExpired) => Err("audio already streaming"),
            (S::Streaming, _) => Err("response in progress"),
        };

        match outcome {
            Ok((to, actions)) => {
                self.state = to;
                Transition {
                    from,
                    to,
                    actions,
                    disposition: Disposition::Applied,
                }
            }
            Err(reason) => Transition {
                from,
                to: from,
                actions: Vec::new(),
                disposition: Disposition::Ignored(reason),
            },
        }
    }

    fn is_interrupted(&self, response_id: Option<&str>) -> bool {
        self.interrupted
            .as_ref()
            .is_some_and(|cut| cut.matches(response_id))
    }

    fn take_interrupted(&mut self, response_id: Option<&str>) -> bool {
        if self.is_interrupted(response_id) {
            self.interrupted = None;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn at(state: ConnectionState) -> Self {
        Self {
            state,
            ..Self::new()
        }
    }
}
