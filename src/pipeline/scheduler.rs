//! Gapless playback scheduling on the output device clock.
//!
//! Inbound deltas are decoded on arrival and queued in order. A single
//! cursor on the device clock (in sample frames) tracks where the next buffer
//! may start: each buffer starts at `max(device_now, cursor)` and moves the
//! cursor to its end, so consecutive buffers neither overlap nor leave gaps.
//! Completion events from the device pull the next pending buffer.

use crate::audio::pcm;
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::InboundAudioChunk;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace};

/// A decoded buffer placed on the device timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableBuffer {
    pub id: u64,
    /// Device frame at which the first sample should render.
    pub start_frame: u64,
    pub samples: Vec<f32>,
}

/// The placement of one buffer on the device timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledSpan {
    pub id: u64,
    pub start_frame: u64,
    pub end_frame: u64,
}

impl ScheduledSpan {
    pub fn frames(&self) -> u64 {
        self.end_frame - self.start_frame
    }
}

/// An output device that renders buffers at requested frames of its clock.
pub trait AudioSink: Send {
    /// Frames per second of the device clock.
    fn sample_rate(&self) -> u32;

    /// Frames rendered so far.
    fn now(&self) -> u64;

    /// Queue a buffer for rendering.
    ///
    /// Returns the frame the buffer will actually start at, which is later
    /// than requested if the device clock has already passed that point.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Device`] if the device can no longer accept audio.
    fn schedule(&mut self, buffer: PlayableBuffer) -> Result<u64>;

    /// Drop every queued buffer and render silence.
    fn stop(&mut self);

    /// Try to restart a stream that reported an error.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Device`] if the stream cannot be resumed.
    fn resume(&mut self) -> Result<()>;
}

/// Queue-and-scheduler loop for inbound speech.
pub struct PlaybackScheduler {
    sink: Option<Box<dyn AudioSink>>,
    pending: VecDeque<(u64, Vec<f32>)>,
    in_flight: VecDeque<ScheduledSpan>,
    cursor: u64,
    next_id: u64,
    lookahead: usize,
    speaking: bool,
    halted: bool,
}

impl PlaybackScheduler {
    /// Create a scheduler that hands at most `lookahead` buffers to the device.
    pub fn new(lookahead: usize) -> Self {
        Self {
            sink: None,
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
            cursor: 0,
            next_id: 0,
            lookahead: lookahead.max(1),
            speaking: false,
            halted: false,
        }
    }

    pub fn has_output(&self) -> bool {
        self.sink.is_some()
    }

    /// Attach the output device. The cursor restarts at the device clock.
    pub fn attach(&mut self, sink: Box<dyn AudioSink>) {
        self.cursor = sink.now();
        self.sink = Some(sink);
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Buffers decoded but not yet handed to the device.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Buffers handed to the device and not yet finished.
    pub fn in_flight(&self) -> impl Iterator<Item = &ScheduledSpan> {
        self.in_flight.iter()
    }

    /// Decode a chunk and queue it behind everything already accepted.
    ///
    /// Returns `Some(true)` when this chunk started the speaking signal.
    /// Chunks arriving after [`halt`](Self::halt) are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Decode`] for a malformed chunk, which is dropped
    /// without disturbing the queue, or [`VoiceError::Device`] if no output
    /// is attached or the device rejects the buffer.
    pub fn enqueue(&mut self, chunk: InboundAudioChunk) -> Result<Option<bool>> {
        if self.halted {
            trace!("playback halted, discarding chunk");
            return Ok(None);
        }
        let samples = pcm::decode_base64(&chunk.payload)?;
        if self.sink.is_none() {
            return Err(VoiceError::Device("no output device attached".into()));
        }

        let id = self.next_id;
        self.next_id += 1;
        self.pending.push_back((id, samples));
        self.pump()?;

        if !self.speaking && !self.in_flight.is_empty() {
            self.speaking = true;
            return Ok(Some(true));
        }
        Ok(None)
    }

    /// Handle a completion event from the device.
    ///
    /// Returns `Some(false)` when the last buffer finished and the speaking
    /// signal cleared.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Device`] if the next buffer cannot be scheduled.
    pub fn on_finished(&mut self, id: u64) -> Result<Option<bool>> {
        match self.in_flight.iter().position(|span| span.id == id) {
            Some(0) => {
                self.in_flight.pop_front();
            }
            Some(pos) => {
                debug!(id, pos, "buffer finished out of order");
                self.in_flight.remove(pos);
            }
            None => {
                trace!(id, "completion for unknown buffer");
                return Ok(None);
            }
        }

        if !self.halted {
            self.pump()?;
        }

        if self.speaking && self.in_flight.is_empty() && self.pending.is_empty() {
            self.speaking = false;
            return Ok(Some(false));
        }
        Ok(None)
    }

    /// Stop everything queued or rendering (barge-in).
    ///
    /// Returns `Some(false)` if the speaking signal cleared.
    pub fn interrupt(&mut self) -> Option<bool> {
        let dropped = self.pending.len() + self.in_flight.len();
        self.pending.clear();
        self.in_flight.clear();
        if let Some(sink) = self.sink.as_mut() {
            sink.stop();
            self.cursor = sink.now();
        }
        if dropped > 0 {
            debug!(dropped, "playback interrupted");
        }
        if self.speaking {
            self.speaking = false;
            return Some(false);
        }
        None
    }

    /// Interrupt and refuse all later audio.
    pub fn halt(&mut self) -> Option<bool> {
        self.halted = true;
        self.interrupt()
    }

    /// Forward a device error to the sink's resume path.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Device`] if nothing is attached or resuming fails.
    pub fn resume_output(&mut self) -> Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.resume(),
            None => Err(VoiceError::Device("no output device attached".into())),
        }
    }

    /// Drop the output device. Returns whether one was attached.
    pub fn release_output(&mut self) -> bool {
        match self.sink.take() {
            Some(mut sink) => {
                sink.stop();
                drop(sink);
                true
            }
            None => false,
        }
    }

    /// Duration of `frames` at the attached device rate.
    pub fn frames_to_duration(&self, frames: u64) -> Duration {
        let rate = self.sink.as_ref().map(|s| s.sample_rate()).unwrap_or(1).max(1);
        Duration::from_secs_f64(frames as f64 / f64::from(rate))
    }

    fn pump(&mut self) -> Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        while self.in_flight.len() < self.lookahead {
            let Some((id, samples)) = self.pending.pop_front() else {
                break;
            };
            let len = samples.len() as u64;
            let requested = sink.now().max(self.cursor);
            let start_frame = sink.schedule(PlayableBuffer {
                id,
                start_frame: requested,
                samples,
            })?;
            let span = ScheduledSpan {
                id,
                start_frame,
                end_frame: start_frame + len,
            };
            trace!(id, start_frame, frames = len, "buffer scheduled");
            self.cursor = span.end_frame;
            self.in_flight.push_back(span);
        }
        Ok(())
    }
}
