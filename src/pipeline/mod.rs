//! Audio paths between the devices and the session: message types, the
//! gapless playback scheduler and the UI envelope.

pub mod envelope;
pub mod messages;
pub mod scheduler;
