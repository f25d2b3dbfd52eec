//! The seam between the session and the outside world.
//!
//! A [`VoiceBackend`] opens the three resources a session needs: the
//! transport, the microphone and the output device. [`CpalBackend`] is the
//! real one; tests substitute in-memory fakes.

use crate::audio::capture::{CaptureHandle, CpalCapture};
use crate::audio::playback::CpalOutput;
use crate::config::{AudioConfig, TransportConfig};
use crate::error::Result;
use crate::pipeline::messages::{CaptureMessage, PlaybackEvent};
use crate::pipeline::scheduler::AudioSink;
use crate::session::transport::{self, TransportLink};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Opens the resources of one session.
pub trait VoiceBackend: Send + Sync {
    /// Start connecting to the voice service.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot even be attempted.
    fn connect(&self, config: &TransportConfig) -> Result<TransportLink>;

    /// Start the microphone. Frames and device loss arrive on `frames`.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Device`](crate::error::VoiceError::Device) if no
    /// input device can be opened.
    fn open_capture(
        &self,
        config: &AudioConfig,
        frames: mpsc::UnboundedSender<CaptureMessage>,
        cancel: CancellationToken,
    ) -> Result<Box<dyn CaptureHandle>>;

    /// Acquire the output device. Completions and stream errors arrive on
    /// `events`.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Device`](crate::error::VoiceError::Device) if no
    /// output device can be opened.
    fn open_output(
        &self,
        config: &AudioConfig,
        events: mpsc::UnboundedSender<PlaybackEvent>,
        cancel: CancellationToken,
    ) -> Result<Box<dyn AudioSink>>;
}

/// System audio devices via cpal and a WebSocket transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl VoiceBackend for CpalBackend {
    fn connect(&self, config: &TransportConfig) -> Result<TransportLink> {
        transport::connect(config)
    }

    fn open_capture(
        &self,
        config: &AudioConfig,
        frames: mpsc::UnboundedSender<CaptureMessage>,
        cancel: CancellationToken,
    ) -> Result<Box<dyn CaptureHandle>> {
        let handle = CpalCapture::start(config, frames, cancel)?;
        Ok(Box::new(handle))
    }

    fn open_output(
        &self,
        config: &AudioConfig,
        events: mpsc::UnboundedSender<PlaybackEvent>,
        cancel: CancellationToken,
    ) -> Result<Box<dyn AudioSink>> {
        let output = CpalOutput::open(config, events, cancel)?;
        Ok(Box::new(output))
    }
}
