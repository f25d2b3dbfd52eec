//! Audio output to system speakers via cpal.
//!
//! [`CpalOutput`] is the session-scoped output device. The cpal stream lives
//! on its own thread; the render callback walks a queue of buffers placed at
//! absolute frames of the device clock and reports each completion over a
//! channel. Dropping the output stops the thread and releases the device.

use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::PlaybackEvent;
use crate::pipeline::scheduler::{AudioSink, PlayableBuffer};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Render-side state shared with the cpal callback.
#[derive(Default)]
struct RenderState {
    /// Frames rendered since the stream started.
    clock: u64,
    queue: VecDeque<PlayableBuffer>,
}

impl RenderState {
    /// Fill `out` from the queue, returning ids of buffers that finished.
    fn render(&mut self, out: &mut [f32], finished: &mut Vec<u64>) {
        for sample in out.iter_mut() {
            *sample = 0.0;
            let t = self.clock;
            if let Some(front) = self.queue.front()
                && t >= front.start_frame
            {
                let offset = (t - front.start_frame) as usize;
                if let Some(&s) = front.samples.get(offset) {
                    *sample = s;
                }
                if offset + 1 >= front.samples.len() {
                    finished.push(front.id);
                    self.queue.pop_front();
                }
            }
            self.clock += 1;
        }
    }
}

fn lock(state: &Mutex<RenderState>) -> MutexGuard<'_, RenderState> {
    match state.lock() {
        Ok(s) => s,
        Err(p) => p.into_inner(),
    }
}

enum OutputCommand {
    Resume(Sender<Result<()>>),
}

/// Audio output to system speakers via cpal.
pub struct CpalOutput {
    state: Arc<Mutex<RenderState>>,
    sample_rate: u32,
    commands: Option<Sender<OutputCommand>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the output device and start rendering silence.
    ///
    /// A stream that fails to start gets one more `play` attempt before the
    /// device is reported unusable.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Device`] if no output device is available or the
    /// stream cannot be started.
    pub fn open(
        config: &AudioConfig,
        events: mpsc::UnboundedSender<PlaybackEvent>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let state = Arc::new(Mutex::new(RenderState::default()));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<OutputCommand>();

        let thread_state = Arc::clone(&state);
        let thread_config = config.clone();
        let thread = std::thread::Builder::new()
            .name("viva-output".into())
            .spawn(move || {
                output_thread(thread_config, thread_state, events, cancel, ready_tx, cmd_rx)
            })
            .map_err(|e| VoiceError::Device(format!("cannot spawn output thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                state,
                sample_rate: config.sample_rate,
                commands: Some(cmd_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::Device("output thread exited during startup".into()))
            }
        }
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
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

impl AudioSink for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> u64 {
        lock(&self.state).clock
    }

    fn schedule(&mut self, mut buffer: PlayableBuffer) -> Result<u64> {
        if self.commands.is_none() {
            return Err(VoiceError::Device("output device released".into()));
        }
        let mut state = lock(&self.state);
        buffer.start_frame = buffer.start_frame.max(state.clock);
        let start = buffer.start_frame;
        state.queue.push_back(buffer);
        Ok(start)
    }

    fn stop(&mut self) {
        lock(&self.state).queue.clear();
    }

    fn resume(&mut self) -> Result<()> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| VoiceError::Device("output device released".into()))?;
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        commands
            .send(OutputCommand::Resume(reply_tx))
            .map_err(|_| VoiceError::Device("output thread gone".into()))?;
        reply_rx
            .recv()
            .map_err(|_| VoiceError::Device("output thread gone".into()))?
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        lock(&self.state).queue.clear();
        // Disconnecting the command channel ends the output thread.
        drop(self.commands.take());
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("output thread panicked during shutdown");
        }
        info!("audio output released");
    }
}

fn output_thread(
    config: AudioConfig,
    state: Arc<Mutex<RenderState>>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    cancel: CancellationToken,
    ready_tx: Sender<Result<()>>,
    commands: Receiver<OutputCommand>,
) {
    let stream = match open_output_stream(&config, state, events, cancel) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(first) = stream.play() {
        warn!("output stream did not start ({first}), retrying once");
        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(VoiceError::Device(format!(
                "failed to start output stream: {e}"
            ))));
            return;
        }
    }
    let _ = ready_tx.send(Ok(()));
    info!("audio output started at {}Hz", config.sample_rate);

    while let Ok(command) = commands.recv() {
        match command {
            OutputCommand::Resume(reply) => {
                let result = stream
                    .play()
                    .map_err(|e| VoiceError::Device(format!("failed to resume output: {e}")));
                let _ = reply.send(result);
            }
        }
    }

    drop(stream);
}

fn open_output_stream(
    config: &AudioConfig,
    state: Arc<Mutex<RenderState>>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    cancel: CancellationToken,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(ref name) = config.output_device {
        host.output_devices()
            .map_err(|e| VoiceError::Device(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| VoiceError::Device(format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| VoiceError::Device("no default output device".into()))?
    };

    let device_name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using output device: {device_name}");

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: config.sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let error_events = events.clone();
    let mut finished = Vec::new();
    device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut st = lock(&state);
                if cancel.is_cancelled() {
                    st.queue.clear();
                }
                st.render(data, &mut finished);
                drop(st);
                for id in finished.drain(..) {
                    let _ = events.send(PlaybackEvent::Finished { id });
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
                let _ = error_events.send(PlaybackEvent::DeviceError {
                    reason: err.to_string(),
                });
            },
            None,
        )
        .map_err(|e| VoiceError::Device(format!("failed to build output stream: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(id: u64, start_frame: u64, samples: Vec<f32>) -> PlayableBuffer {
        PlayableBuffer {
            id,
            start_frame,
            samples,
        }
    }

    #[test]
    fn render_places_buffers_on_the_clock() {
        let mut state = RenderState::default();
        state.queue.push_back(buffer(0, 2, vec![0.5, 0.5]));
        state.queue.push_back(buffer(1, 4, vec![-0.5]));

        let mut out = [1.0_f32; 6];
        let mut finished = Vec::new();
        state.render(&mut out, &mut finished);

        assert_eq!(out, [0.0, 0.0, 0.5, 0.5, -0.5, 0.0]);
        assert_eq!(finished, vec![0, 1]);
        assert_eq!(state.clock, 6);
        assert!(state.queue.is_empty());
    }

    #[test]
    fn render_spans_callbacks() {
        let mut state = RenderState::default();
        state.queue.push_back(buffer(7, 0, vec![0.1, 0.2, 0.3]));

        let mut finished = Vec::new();
        let mut first = [0.0_f32; 2];
        state.render(&mut first, &mut finished);
        assert!(finished.is_empty());

        let mut second = [0.0_f32; 2];
        state.render(&mut second, &mut finished);
        assert_eq!(first, [0.1, 0.2]);
        assert_eq!(second, [0.3, 0.0]);
        assert_eq!(finished, vec![7]);
    }

    #[test]
    fn empty_queue_renders_silence() {
        let mut state = RenderState::default();
        let mut out = [0.7_f32; 4];
        let mut finished = Vec::new();
        state.render(&mut out, &mut finished);
        assert_eq!(out, [0.0; 4]);
        assert_eq!(state.clock, 4);
    }
}
