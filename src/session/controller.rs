//! The session driver: one control task per conversation.
//!
//! [`VoiceSession::start`] spawns a task that owns every resource of the
//! session and waits on all of its inputs at once: cancellation, transport
//! events, capture frames, playback completions, timers and the envelope
//! ticker. Each input becomes a [`SessionEvent`]; the state machine decides
//! the transition and the driver performs the resulting actions.

use crate::audio::pcm;
use crate::config::VoiceConfig;
use crate::error::{ErrorKind, Result, VoiceError};
use crate::pipeline::envelope::{EnvelopeExtractor, EnvelopeSource};
use crate::pipeline::messages::{CaptureMessage, InboundAudioChunk, PlaybackEvent};
use crate::pipeline::scheduler::PlaybackScheduler;
use crate::runtime::SessionObserver;
use crate::session::backend::VoiceBackend;
use crate::session::dispatch::{Inbound, dispatch};
use crate::session::lifecycle::{Lifecycle, TimerKind};
use crate::session::protocol::{ClientEvent, SessionPayload};
use crate::session::state::{Action, ConnectionState, Disposition, SessionEvent, SessionMachine};
use crate::session::transport::{TransportCommand, TransportEvent};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};
use uuid::Uuid;

/// Handle to a running voice session.
///
/// Dropping the handle cancels the session; call [`end`](Self::end) to wait
/// for teardown to finish.
pub struct VoiceSession {
    id: Uuid,
    cancel: CancellationToken,
    task: Option<JoinHandle<ConnectionState>>,
    final_state: Option<ConnectionState>,
}

impl VoiceSession {
    /// Start a session: connect, configure the remote side, start capture.
    ///
    /// Progress is reported through `observer`.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Config`] if the configuration is invalid or no
    /// tokio runtime is running. Connection and device failures are reported
    /// asynchronously through [`SessionObserver::on_error`].
    pub fn start(
        config: VoiceConfig,
        backend: Arc<dyn VoiceBackend>,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| VoiceError::Config(format!("no tokio runtime: {e}")))?;

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let driver = SessionDriver::new(config, backend, observer, cancel.clone());
        let span = info_span!("voice_session", %id);
        let task = runtime.spawn(driver.run().instrument(span));

        Ok(Self {
            id,
            cancel,
            task: Some(task),
            final_state: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the control task has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Wait for the session to finish on its own.
    ///
    /// Dropping the returned future leaves the session running.
    pub async fn wait(&mut self) -> ConnectionState {
        if let Some(state) = self.final_state {
            return state;
        }
        let state = match self.task.as_mut() {
            Some(task) => join(task).await,
            None => ConnectionState::Idle,
        };
        self.task = None;
        self.final_state = Some(state);
        state
    }

    /// End the session from any state and wait for teardown.
    ///
    /// Returns the final state. Calling it again returns the same state.
    pub async fn end(&mut self) -> ConnectionState {
        self.cancel.cancel();
        self.wait().await
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn join(task: &mut JoinHandle<ConnectionState>) -> ConnectionState {
    match task.await {
        Ok(state) => state,
        Err(e) => {
            error!("session task failed: {e}");
            ConnectionState::Errored
        }
    }
}

/// What woke the control loop.
enum Wake {
    Cancelled,
    Transport(Option<TransportEvent>),
    Capture(CaptureMessage),
    Playback(PlaybackEvent),
    Timer(TimerKind),
    Tick(Instant),
}

/// State owned by the control task.
struct SessionDriver {
    config: VoiceConfig,
    backend: Arc<dyn VoiceBackend>,
    observer: Arc<dyn SessionObserver>,
    cancel: CancellationToken,
    machine: SessionMachine,
    lifecycle: Lifecycle,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    // Senders are kept so the receivers never report closed.
    capture_tx: mpsc::UnboundedSender<CaptureMessage>,
    capture_rx: mpsc::UnboundedReceiver<CaptureMessage>,
    playback_tx: mpsc::UnboundedSender<PlaybackEvent>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    envelope: EnvelopeExtractor,
    /// Events raised while performing actions, handled before the next wake.
    follow_ups: VecDeque<SessionEvent>,
    /// Audio carried by the `AudioDelta` being handled.
    pending_chunk: Option<InboundAudioChunk>,
    output_resumed: bool,
}

impl SessionDriver {
    fn new(
        config: VoiceConfig,
        backend: Arc<dyn VoiceBackend>,
        observer: Arc<dyn SessionObserver>,
        cancel: CancellationToken,
    ) -> Self {
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let envelope = EnvelopeExtractor::new(&config.envelope, config.audio.sample_rate);
        let playback = PlaybackScheduler::new(config.audio.playback_lookahead);
        Self {
            config,
            backend,
            observer,
            cancel,
            machine: SessionMachine::new(),
            lifecycle: Lifecycle::new(playback),
            transport_events: None,
            capture_tx,
            capture_rx,
            playback_tx,
            playback_rx,
            envelope,
            follow_ups: VecDeque::new(),
            pending_chunk: None,
            output_resumed: false,
        }
    }

    async fn run(mut self) -> ConnectionState {
        info!(
            sample_rate = self.config.audio.sample_rate,
            frame_size = self.config.audio.frame_size,
            "voice session starting"
        );
        self.apply(SessionEvent::Start);

        let mut ticker = tokio::time::interval(self.config.envelope.tick_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();
        let mut cancel_seen = false;

        while !self.finished() {
            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !cancel_seen => Wake::Cancelled,
                event = recv_transport(&mut self.transport_events) => Wake::Transport(event),
                Some(msg) = self.capture_rx.recv() => Wake::Capture(msg),
                Some(event) = self.playback_rx.recv() => Wake::Playback(event),
                kind = self.lifecycle.timers.next_expiry() => Wake::Timer(kind),
                now = ticker.tick() => Wake::Tick(now),
            };

            match wake {
                Wake::Cancelled => {
                    cancel_seen = true;
                    info!("session cancelled");
                    self.apply(SessionEvent::Cancel);
                    self.release_all();
                }
                Wake::Transport(event) => self.on_transport(event),
                Wake::Capture(msg) => self.on_capture(msg),
                Wake::Playback(event) => self.on_playback(event),
                Wake::Timer(kind) => self.on_timer(kind),
                Wake::Tick(now) => {
                    let dt = now.saturating_duration_since(last_tick);
                    last_tick = now;
                    self.on_tick(dt);
                }
            }
        }

        self.release_all();
        let state = self.machine.state();
        info!(%state, "voice session finished");
        state
    }

    /// Idle with nothing left to play, or failed with the transport gone.
    fn finished(&self) -> bool {
        match self.machine.state() {
            ConnectionState::Idle => {
                self.transport_events.is_none() && !self.lifecycle.playback.is_speaking()
            }
            ConnectionState::Errored => self.transport_events.is_none(),
            _ => false,
        }
    }

    // -- inputs --

    fn on_transport(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Opened) => {
                info!("transport open");
                self.apply(SessionEvent::TransportOpened);
            }
            Some(TransportEvent::Message(text)) => match dispatch(&text) {
                Inbound::AudioDelta(chunk) => {
                    let event = SessionEvent::AudioDelta {
                        response_id: chunk.response_id.clone(),
                    };
                    self.pending_chunk = Some(chunk);
                    self.apply(event);
                }
                inbound => {
                    if let Some(event) = inbound.session_event() {
                        self.apply(event);
                    }
                }
            },
            Some(TransportEvent::Error(reason)) => {
                error!("transport error: {reason}");
                self.drop_transport();
                self.apply(SessionEvent::Failed(ErrorKind::Transport));
            }
            Some(TransportEvent::Closed) | None => {
                info!("transport closed by peer");
                self.drop_transport();
                self.apply(SessionEvent::TransportClosed);
            }
        }
    }

    fn on_capture(&mut self, msg: CaptureMessage) {
        match msg {
            CaptureMessage::Frame { frame, captured_at } => {
                if !self.lifecycle.capture_running() {
                    trace!(sequence = frame.sequence, "frame after capture stopped");
                    return;
                }
                self.envelope.observe_capture(&frame.samples);
                trace!(
                    sequence = frame.sequence,
                    queued_us = captured_at.elapsed().as_micros() as u64,
                    "frame captured"
                );
                self.send(ClientEvent::InputAudioAppend {
                    audio: pcm::encode_base64(&frame.samples),
                });
            }
            CaptureMessage::DeviceLost { reason } => {
                if self.lifecycle.stop_capture() {
                    error!("input device lost: {reason}");
                    self.apply(SessionEvent::Failed(ErrorKind::Device));
                }
            }
        }
    }

    fn on_playback(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Finished { id } => match self.lifecycle.playback.on_finished(id) {
                Ok(Some(speaking)) => self.observer.on_speaking_change(speaking),
                Ok(None) => {}
                Err(e) => {
                    error!("cannot schedule next buffer: {e}");
                    self.apply(SessionEvent::Failed(ErrorKind::Device));
                }
            },
            PlaybackEvent::DeviceError { reason } => {
                if !self.lifecycle.playback.has_output() {
                    return;
                }
                if self.output_resumed {
                    error!("output device failed again: {reason}");
                    self.apply(SessionEvent::Failed(ErrorKind::Device));
                    return;
                }
                self.output_resumed = true;
                warn!("output device error ({reason}), resuming once");
                if let Err(e) = self.lifecycle.playback.resume_output() {
                    error!("output device did not resume: {e}");
                    self.apply(SessionEvent::Failed(ErrorKind::Device));
                }
            }
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        debug!(?kind, "timer expired");
        let event = match kind {
            TimerKind::Settle => SessionEvent::SettleElapsed,
            TimerKind::Fallback => SessionEvent::FallbackExpired,
            TimerKind::Grace => SessionEvent::GraceElapsed,
        };
        self.apply(event);
    }

    fn on_tick(&mut self, dt: std::time::Duration) {
        let source = if self.lifecycle.playback.is_speaking() {
            EnvelopeSource::Remote
        } else if self.lifecycle.capture_running() && self.machine.state().transport_open() {
            EnvelopeSource::Microphone
        } else {
            EnvelopeSource::Silent
        };
        let level = self.envelope.tick(source, dt);
        self.observer.on_level(level);
    }

    // -- state machine --

    /// Feed an event, and every event its actions raise, through the machine.
    fn apply(&mut self, event: SessionEvent) {
        self.follow_ups.push_back(event);
        while let Some(event) = self.follow_ups.pop_front() {
            let transition = self.machine.handle(event.clone());
            if let Disposition::Ignored(reason) = transition.disposition {
                debug!(?event, state = %transition.from, reason, "event ignored");
                continue;
            }
            if transition.changed() {
                info!(from = %transition.from, to = %transition.to, "state changed");
                self.observer.on_state_change(transition.from, transition.to);
            }
            for action in transition.actions {
                self.perform(action);
            }
        }
        // Audio not claimed by a SchedulePlayback is discarded.
        self.pending_chunk = None;
    }

    fn perform(&mut self, action: Action) {
        trace!(?action, "performing");
        match action {
            Action::OpenTransport => match self.backend.connect(&self.config.transport) {
                Ok(link) => {
                    self.lifecycle.set_transport(link.commands);
                    self.transport_events = Some(link.events);
                }
                Err(e) => {
                    error!("cannot connect: {e}");
                    self.raise(e.kind().unwrap_or(ErrorKind::Transport));
                }
            },
            Action::SendSessionUpdate => {
                let session = SessionPayload::from(&self.config.session);
                self.send(ClientEvent::SessionUpdate { session });
            }
            Action::StartCapture => {
                match self.backend.open_capture(
                    &self.config.audio,
                    self.capture_tx.clone(),
                    self.cancel.clone(),
                ) {
                    Ok(capture) => self.lifecycle.set_capture(capture),
                    Err(e) => {
                        error!("cannot start capture: {e}");
                        self.raise(ErrorKind::Device);
                    }
                }
            }
            Action::ArmSettle => {
                let delay = self.config.timing.settle_delay();
                self.lifecycle.timers.arm(TimerKind::Settle, delay);
            }
            Action::SendResponseCreate => self.send(ClientEvent::ResponseCreate),
            Action::ArmFallback => {
                let timeout = self.config.timing.fallback_timeout();
                self.lifecycle.timers.arm(TimerKind::Fallback, timeout);
            }
            Action::CancelFallback => {
                self.lifecycle.timers.cancel(TimerKind::Fallback);
            }
            Action::SchedulePlayback => self.schedule_chunk(),
            Action::InterruptPlayback => {
                if let Some(speaking) = self.lifecycle.playback.interrupt() {
                    self.observer.on_speaking_change(speaking);
                }
            }
            Action::SendResponseCancel => self.send(ClientEvent::ResponseCancel),
            Action::ArmGrace => {
                let grace = self.config.timing.close_grace();
                self.lifecycle.timers.arm(TimerKind::Grace, grace);
            }
            Action::StopCapture => {
                self.lifecycle.stop_capture();
            }
            Action::CloseTransport => {
                if self.lifecycle.close_transport() {
                    self.transport_events = None;
                    self.follow_ups.push_back(SessionEvent::TransportClosed);
                }
            }
            Action::CancelTimers => {
                self.lifecycle.timers.cancel_all();
            }
            Action::HaltPlayback => {
                if let Some(speaking) = self.lifecycle.playback.halt() {
                    self.observer.on_speaking_change(speaking);
                }
            }
            Action::Teardown => {
                self.release_all();
                self.follow_ups.push_back(SessionEvent::TransportClosed);
            }
            Action::ReportError(kind) => {
                error!(%kind, "session failed");
                self.observer.on_error(kind);
            }
        }
    }

    // -- effects --

    fn raise(&mut self, kind: ErrorKind) {
        self.follow_ups.push_back(SessionEvent::Failed(kind));
    }

    /// Write a message if the transport is open and the session is live.
    fn send(&mut self, event: ClientEvent) {
        if self.cancel.is_cancelled() || !self.machine.state().transport_open() {
            trace!(state = %self.machine.state(), "not sending, transport not open");
            return;
        }
        let Some(commands) = self.lifecycle.transport() else {
            return;
        };
        match event.to_json() {
            Ok(json) => {
                if commands.send(TransportCommand::Send(json)).is_err() {
                    debug!("transport task gone, message dropped");
                }
            }
            Err(e) => warn!("cannot serialize client event: {e}"),
        }
    }

    fn schedule_chunk(&mut self) {
        let Some(chunk) = self.pending_chunk.take() else {
            return;
        };
        if self.cancel.is_cancelled() || !self.machine.state().accepts_audio() {
            return;
        }

        if !self.lifecycle.playback.has_output() && !self.acquire_output() {
            self.raise(ErrorKind::Device);
            return;
        }

        match self.lifecycle.playback.enqueue(chunk) {
            Ok(Some(speaking)) => self.observer.on_speaking_change(speaking),
            Ok(None) => {}
            Err(VoiceError::Decode(reason)) => {
                warn!("dropping undecodable audio chunk: {reason}");
            }
            Err(e) => {
                error!("cannot schedule audio: {e}");
                self.raise(e.kind().unwrap_or(ErrorKind::Device));
            }
        }
    }

    /// Open the output device, retrying once from the session's single
    /// resume budget.
    fn acquire_output(&mut self) -> bool {
        loop {
            match self.backend.open_output(
                &self.config.audio,
                self.playback_tx.clone(),
                self.cancel.clone(),
            ) {
                Ok(sink) => {
                    self.lifecycle.playback.attach(sink);
                    return true;
                }
                Err(e) if !self.output_resumed => {
                    self.output_resumed = true;
                    warn!("cannot open output device ({e}), retrying once");
                }
                Err(e) => {
                    error!("cannot open output device: {e}");
                    return false;
                }
            }
        }
    }

    fn drop_transport(&mut self) {
        self.transport_events = None;
        self.lifecycle.close_transport();
    }

    /// Tear down every resource, clearing the speaking signal if it was set.
    fn release_all(&mut self) {
        let was_speaking = self.lifecycle.playback.is_speaking();
        self.lifecycle.end_session();
        self.transport_events = None;
        if was_speaking {
            self.observer.on_speaking_change(false);
        }
    }
}

async fn recv_transport(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
