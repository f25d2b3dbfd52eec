//! Viva: real-time duplex voice conversation core.
//!
//! A session streams microphone audio to a realtime voice service over a
//! WebSocket and plays the spoken reply back without gaps:
//! Microphone → Frame Encoder → Transport → Service → Scheduler → Speaker
//!
//! # Architecture
//!
//! - **Audio capture**: records from the microphone via `cpal` and slices it
//!   into PCM16 frames on a dedicated thread
//! - **Transport**: JSON events and base64 audio over `tokio-tungstenite`
//! - **Session**: a pure state machine driven by one control task per session
//! - **Playback**: decoded deltas scheduled back to back on the device clock
//! - **Envelope**: a smoothed 0..1 level for avatar or meter animation
//! - **Lifecycle**: idempotent teardown of every resource a session holds

pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod runtime;
pub mod session;

pub use config::VoiceConfig;
pub use error::{ErrorKind, Result, VoiceError};
pub use runtime::{RuntimeEvent, SessionObserver};
pub use session::{ConnectionState, CpalBackend, VoiceBackend, VoiceSession};
