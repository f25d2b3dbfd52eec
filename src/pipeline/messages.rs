//! Message types passed between the capture thread, the control task and
//! the output device.

use std::time::Instant;

/// A fixed-length block of PCM16 samples produced by the frame encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Position of this frame in the capture stream, starting at 0.
    pub sequence: u64,
    /// Mono PCM16 samples at the session sample rate.
    pub samples: Vec<i16>,
}

/// Messages from the capture thread to the control path.
#[derive(Debug, Clone)]
pub enum CaptureMessage {
    /// One complete audio frame.
    Frame {
        frame: AudioFrame,
        /// When the last sample of the frame left the device callback.
        captured_at: Instant,
    },
    /// The input device stopped working. No further frames follow.
    DeviceLost { reason: String },
}

/// A base64 PCM16 delta as received from the voice service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundAudioChunk {
    /// Response the delta belongs to, when the service reports it.
    pub response_id: Option<String>,
    /// Base64-encoded little-endian PCM16.
    pub payload: String,
}

/// Events reported by the output device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The buffer with this id rendered its last sample.
    Finished { id: u64 },
    /// The output stream reported an error.
    DeviceError { reason: String },
}
