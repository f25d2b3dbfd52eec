//! The conversation session: wire protocol, state machine, transport and
//! the control task that ties them to the audio devices.

pub mod backend;
pub mod controller;
pub mod dispatch;
pub mod lifecycle;
pub mod protocol;
pub mod state;
pub mod transport;

pub use backend::{CpalBackend, VoiceBackend};
pub use controller::VoiceSession;
pub use state::ConnectionState;
