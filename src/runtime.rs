//! Runtime events emitted by a voice session for UI and observability.
//!
//! This is intentionally lightweight (no audio payloads) so the control task
//! can emit events without blocking critical audio paths.

use crate::error::ErrorKind;
use crate::session::state::ConnectionState;
use tokio::sync::broadcast;

/// Consumer callbacks for a running session.
///
/// Callbacks run on the session's control task and must return quickly.
/// Every method defaults to doing nothing.
pub trait SessionObserver: Send + Sync {
    /// Smoothed amplitude envelope in \[0, 1\], once per render tick.
    fn on_level(&self, _level: f32) {}

    /// The remote voice started or stopped playing.
    fn on_speaking_change(&self, _speaking: bool) {}

    /// The session failed.
    fn on_error(&self, _kind: ErrorKind) {}

    fn on_state_change(&self, _from: ConnectionState, _to: ConnectionState) {}
}

/// Events that describe what the session is doing "right now".
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// Envelope sample for avatar or meter animation.
    Level(f32),
    /// Whether the remote voice is currently audible.
    Speaking(bool),
    /// Consumer-facing error category.
    Error(ErrorKind),
    /// Connection state transition.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Channel-based consumers subscribe to a broadcast sender. Sending with no
/// subscribers is not an error.
impl SessionObserver for broadcast::Sender<RuntimeEvent> {
    fn on_level(&self, level: f32) {
        let _ = self.send(RuntimeEvent::Level(level));
    }

    fn on_speaking_change(&self, speaking: bool) {
        let _ = self.send(RuntimeEvent::Speaking(speaking));
    }

    fn on_error(&self, kind: ErrorKind) {
        let _ = self.send(RuntimeEvent::Error(kind));
    }

    fn on_state_change(&self, from: ConnectionState, to: ConnectionState) {
        let _ = self.send(RuntimeEvent::StateChanged { from, to });
    }
}
