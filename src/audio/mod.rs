//! Audio capture, playback, and PCM16 conversion via cpal.

pub mod capture;
pub mod pcm;
pub mod playback;
