//! Microphone audio capture using cpal.
//!
//! The cpal callback mixes to mono, resamples to the session rate and hands
//! each block to a dedicated capture thread. That thread runs the
//! [`FrameEncoder`] and forwards fixed-size PCM16 frames to the control task,
//! so frame production never waits on control work.

use crate::audio::pcm;
use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::{AudioFrame, CaptureMessage};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A running capture source. Stopping releases the microphone.
pub trait CaptureHandle: Send {
    /// Stop producing frames and release the device.
    ///
    /// Calling this more than once is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the capture thread could not be joined cleanly.
    fn stop(&mut self) -> Result<()>;
}

/// Slices a continuous sample stream into fixed-size PCM16 frames.
///
/// Samples that do not fill a frame are carried into the next push; a
/// trailing partial frame is never emitted.
pub struct FrameEncoder {
    frame_size: usize,
    pending: Vec<f32>,
    next_sequence: u64,
}

impl FrameEncoder {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size: frame_size.max(1),
            pending: Vec::with_capacity(frame_size * 2),
            next_sequence: 0,
        }
    }

    /// Append samples and return every frame that is now complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);
        let complete = self.pending.len() / self.frame_size;
        if complete == 0 {
            return Vec::new();
        }

        let mut frames = Vec::with_capacity(complete);
        for block in self.pending.chunks_exact(self.frame_size) {
            frames.push(AudioFrame {
                sequence: self.next_sequence,
                samples: pcm::encode_samples(block),
            });
            self.next_sequence += 1;
        }
        self.pending.drain(..complete * self.frame_size);
        frames
    }

    /// Samples waiting for the next frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Time covered by one frame at `sample_rate`.
    pub fn frame_duration(&self, sample_rate: u32) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.frame_size as f64 / f64::from(sample_rate.max(1)))
    }
}

/// Microphone capture via cpal.
pub struct CpalCapture;

impl CpalCapture {
    /// Open the input device and start the capture thread.
    ///
    /// Returns once the stream is running, or with the error that prevented
    /// it from starting.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Device`] if no usable input device is available.
    pub fn start(
        config: &AudioConfig,
        tx: mpsc::UnboundedSender<CaptureMessage>,
        cancel: CancellationToken,
    ) -> Result<CpalCaptureHandle> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let config = config.clone();

        let thread = std::thread::Builder::new()
            .name("viva-capture".into())
            .spawn(move || capture_thread(config, tx, cancel, ready_tx, stop_rx))
            .map_err(|e| VoiceError::Device(format!("cannot spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(CpalCaptureHandle {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::Device("capture thread exited during startup".into()))
            }
        }
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| VoiceError::Device(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

/// Handle to the capture thread started by [`CpalCapture::start`].
pub struct CpalCaptureHandle {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle for CpalCaptureHandle {
    fn stop(&mut self) -> Result<()> {
        // Dropping the sender disconnects the stop channel and wakes the thread.
        drop(self.stop_tx.take());
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| VoiceError::Device("capture thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for CpalCaptureHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("capture shutdown: {e}");
        }
    }
}

enum Wake {
    Samples(Vec<f32>),
    Fault(String),
    Stop,
}

fn capture_thread(
    config: AudioConfig,
    tx: mpsc::UnboundedSender<CaptureMessage>,
    cancel: CancellationToken,
    ready_tx: Sender<Result<()>>,
    stop_rx: Receiver<()>,
) {
    let (raw_tx, raw_rx) = crossbeam_channel::unbounded::<Vec<f32>>();
    let (fault_tx, fault_rx) = crossbeam_channel::bounded::<String>(1);

    let stream = match open_input_stream(&config, raw_tx, fault_tx) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    let mut encoder = FrameEncoder::new(config.frame_size);
    info!(
        "capture thread started: {} samples/frame at {}Hz ({:?} per frame)",
        config.frame_size,
        config.sample_rate,
        encoder.frame_duration(config.sample_rate)
    );

    loop {
        let wake = crossbeam_channel::select! {
            recv(raw_rx) -> block => match block {
                Ok(samples) => Wake::Samples(samples),
                Err(_) => Wake::Fault("input stream closed".into()),
            },
            recv(fault_rx) -> fault => {
                Wake::Fault(fault.unwrap_or_else(|_| "input stream closed".into()))
            },
            recv(stop_rx) -> _ => Wake::Stop,
        };

        match wake {
            Wake::Samples(samples) => {
                if cancel.is_cancelled() {
                    continue;
                }
                let captured_at = Instant::now();
                let mut receiver_gone = false;
                for frame in encoder.push(&samples) {
                    if tx.send(CaptureMessage::Frame { frame, captured_at }).is_err() {
                        receiver_gone = true;
                        break;
                    }
                }
                if receiver_gone {
                    debug!("capture receiver dropped, stopping");
                    break;
                }
            }
            Wake::Fault(reason) => {
                error!("audio input stream error: {reason}");
                let _ = tx.send(CaptureMessage::DeviceLost { reason });
                break;
            }
            Wake::Stop => break,
        }
    }

    drop(stream);
    info!("audio capture stopped");
}

fn open_input_stream(
    config: &AudioConfig,
    raw_tx: Sender<Vec<f32>>,
    fault_tx: Sender<String>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(ref name) = config.input_device {
        host.input_devices()
            .map_err(|e| VoiceError::Device(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| VoiceError::Device(format!("input device '{name}' not found")))?
    } else {
        host.default_input_device()
            .ok_or_else(|| VoiceError::Device("no default input device".into()))?
    };

    let device_name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using input device: {device_name}");

    // Use the device's default config for best compatibility
    let default_config = device
        .default_input_config()
        .map_err(|e| VoiceError::Device(format!("no default input config: {e}")))?;

    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();
    let target_rate = config.sample_rate;

    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    info!(
        "native input config: {}Hz, {} channels -> {}Hz mono",
        native_rate, native_channels, target_rate
    );

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = if native_channels > 1 {
                    to_mono(data, native_channels)
                } else {
                    data.to_vec()
                };
                let samples = if native_rate != target_rate {
                    resample(&mono, native_rate, target_rate)
                } else {
                    mono
                };
                // Unbounded: the capture thread drains it, the callback never waits.
                let _ = raw_tx.send(samples);
            },
            move |err| {
                let _ = fault_tx.try_send(err.to_string());
            },
            None,
        )
        .map_err(|e| VoiceError::Device(format!("failed to build input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| VoiceError::Device(format!("failed to start input stream: {e}")))?;

    Ok(stream)
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler.
///
/// Speech energy sits well below the Nyquist limit of the 24kHz wire rate,
/// so no anti-alias filter is applied.
fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}
