//! End-to-end session tests against an in-memory backend.
//!
//! The fake transport hands both channel ends to the test, the fake output
//! device completes buffers on the tokio clock, and every test runs with a
//! paused clock so timers fire deterministically.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use viva::audio::capture::CaptureHandle;
use viva::audio::pcm;
use viva::config::{AudioConfig, TransportConfig};
use viva::pipeline::messages::{AudioFrame, CaptureMessage, PlaybackEvent};
use viva::pipeline::scheduler::{AudioSink, PlayableBuffer, ScheduledSpan};
use viva::session::transport::{TransportCommand, TransportEvent, TransportLink};
use viva::{ConnectionState, ErrorKind, SessionObserver, VoiceBackend, VoiceConfig, VoiceError, VoiceSession};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// What the backend opened, shared with the test.
#[derive(Default)]
struct Rig {
    capture: Mutex<Option<mpsc::UnboundedSender<CaptureMessage>>>,
    capture_stops: AtomicUsize,
    output_attempts: AtomicUsize,
    output_opens: AtomicUsize,
    output_released: AtomicBool,
    output_events: Mutex<Option<mpsc::UnboundedSender<PlaybackEvent>>>,
    resumes: AtomicUsize,
    spans: Mutex<Vec<ScheduledSpan>>,
    /// How many `open_output` calls fail before one succeeds.
    output_failures: AtomicUsize,
    fail_resume: AtomicBool,
    fail_connect: AtomicBool,
}

impl Rig {
    fn push_frame(&self, sequence: u64) {
        let guard = self.capture.lock().unwrap();
        let tx = guard.as_ref().expect("capture not started");
        tx.send(CaptureMessage::Frame {
            frame: AudioFrame {
                sequence,
                samples: vec![1000; 2048],
            },
            captured_at: std::time::Instant::now(),
        })
        .unwrap();
    }

    fn lose_capture(&self) {
        let guard = self.capture.lock().unwrap();
        guard
            .as_ref()
            .expect("capture not started")
            .send(CaptureMessage::DeviceLost {
                reason: "unplugged".into(),
            })
            .unwrap();
    }

    /// Report a stream error from the output device.
    fn break_output(&self) {
        let guard = self.output_events.lock().unwrap();
        guard
            .as_ref()
            .expect("output not opened")
            .send(PlaybackEvent::DeviceError {
                reason: "stream invalidated".into(),
            })
            .unwrap();
    }

    fn spans(&self) -> Vec<ScheduledSpan> {
        self.spans.lock().unwrap().clone()
    }
}

/// The service side of a fake transport.
struct Service {
    commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Service {
    fn emit(&self, json: &str) {
        self.events
            .send(TransportEvent::Message(json.to_owned()))
            .unwrap();
    }

    fn open(&self) {
        self.events.send(TransportEvent::Opened).unwrap();
    }

    fn delta(&self, response_id: &str, payload: &str) {
        self.emit(&format!(
            r#"{{"type":"response.audio.delta","response_id":"{response_id}","delta":"{payload}"}}"#
        ));
    }

    fn done(&self, response_id: &str) {
        self.emit(&format!(
            r#"{{"type":"response.done","response":{{"id":"{response_id}","status":"completed"}}}}"#
        ));
    }

    /// The `type` of the next command, or "close".
    async fn next_command(&mut self) -> String {
        match self.commands.recv().await {
            Some(TransportCommand::Send(json)) => {
                let value: serde_json::Value = serde_json::from_str(&json).unwrap();
                value["type"].as_str().unwrap().to_owned()
            }
            Some(TransportCommand::Close) => "close".to_owned(),
            None => "gone".to_owned(),
        }
    }

    /// Skip audio appends until a command of another type arrives.
    async fn next_control(&mut self) -> String {
        loop {
            let kind = self.next_command().await;
            if kind != "input_audio_buffer.append" {
                return kind;
            }
        }
    }
}

struct FakeBackend {
    rig: Arc<Rig>,
    services: mpsc::UnboundedSender<Service>,
}

impl VoiceBackend for FakeBackend {
    fn connect(&self, _config: &TransportConfig) -> viva::Result<TransportLink> {
        if self.rig.fail_connect.load(Ordering::SeqCst) {
            return Err(VoiceError::Transport("connection refused".into()));
        }
        let (link, commands, events) = TransportLink::pair();
        self.services.send(Service { commands, events }).unwrap();
        Ok(link)
    }

    fn open_capture(
        &self,
        _config: &AudioConfig,
        frames: mpsc::UnboundedSender<CaptureMessage>,
        _cancel: CancellationToken,
    ) -> viva::Result<Box<dyn CaptureHandle>> {
        *self.rig.capture.lock().unwrap() = Some(frames);
        Ok(Box::new(FakeCapture {
            rig: Arc::clone(&self.rig),
        }))
    }

    fn open_output(
        &self,
        config: &AudioConfig,
        events: mpsc::UnboundedSender<PlaybackEvent>,
        _cancel: CancellationToken,
    ) -> viva::Result<Box<dyn AudioSink>> {
        self.rig.output_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .rig
            .output_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(VoiceError::Device("no output device".into()));
        }
        self.rig.output_opens.fetch_add(1, Ordering::SeqCst);
        *self.rig.output_events.lock().unwrap() = Some(events.clone());
        Ok(Box::new(FakeSink {
            rig: Arc::clone(&self.rig),
            opened: Instant::now(),
            rate: config.sample_rate,
            events,
            completions: Vec::new(),
        }))
    }
}

struct FakeCapture {
    rig: Arc<Rig>,
}

impl CaptureHandle for FakeCapture {
    fn stop(&mut self) -> viva::Result<()> {
        self.rig.capture_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Output device whose clock is the tokio clock.
struct FakeSink {
    rig: Arc<Rig>,
    opened: Instant,
    rate: u32,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    completions: Vec<JoinHandle<()>>,
}

impl AudioSink for FakeSink {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn now(&self) -> u64 {
        (self.opened.elapsed().as_secs_f64() * f64::from(self.rate)) as u64
    }

    fn schedule(&mut self, buffer: PlayableBuffer) -> viva::Result<u64> {
        let start = buffer.start_frame.max(self.now());
        let end = start + buffer.samples.len() as u64;
        self.rig.spans.lock().unwrap().push(ScheduledSpan {
            id: buffer.id,
            start_frame: start,
            end_frame: end,
        });

        let deadline = self.opened + Duration::from_secs_f64(end as f64 / f64::from(self.rate));
        let events = self.events.clone();
        let id = buffer.id;
        self.completions.push(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = events.send(PlaybackEvent::Finished { id });
        }));
        Ok(start)
    }

    fn stop(&mut self) {
        for task in self.completions.drain(..) {
            task.abort();
        }
    }

    fn resume(&mut self) -> viva::Result<()> {
        self.rig.resumes.fetch_add(1, Ordering::SeqCst);
        if self.rig.fail_resume.load(Ordering::SeqCst) {
            return Err(VoiceError::Device("device still suspended".into()));
        }
        Ok(())
    }
}

impl Drop for FakeSink {
    fn drop(&mut self) {
        self.rig.output_released.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    State(ConnectionState),
    Speaking(bool),
    Error(ErrorKind),
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Seen>>,
    levels: AtomicUsize,
}

impl SessionObserver for Recorder {
    fn on_level(&self, level: f32) {
        assert!((0.0..=1.0).contains(&level));
        self.levels.fetch_add(1, Ordering::SeqCst);
    }

    fn on_speaking_change(&self, speaking: bool) {
        self.seen.lock().unwrap().push(Seen::Speaking(speaking));
    }

    fn on_error(&self, kind: ErrorKind) {
        self.seen.lock().unwrap().push(Seen::Error(kind));
    }

    fn on_state_change(&self, _from: ConnectionState, to: ConnectionState) {
        self.seen.lock().unwrap().push(Seen::State(to));
    }
}

impl Recorder {
    fn states(&self) -> Vec<ConnectionState> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| match s {
                Seen::State(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn errors(&self) -> Vec<ErrorKind> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| match s {
                Seen::Error(kind) => Some(*kind),
                _ => None,
            })
            .collect()
    }

    fn speaking(&self) -> Vec<bool> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| match s {
                Seen::Speaking(on) => Some(*on),
                _ => None,
            })
            .collect()
    }
}

struct Harness {
    session: VoiceSession,
    rig: Arc<Rig>,
    recorder: Arc<Recorder>,
    services: mpsc::UnboundedReceiver<Service>,
}

fn start_with(rig: Rig) -> Harness {
    let rig = Arc::new(rig);
    let recorder = Arc::new(Recorder::default());
    let (services_tx, services) = mpsc::unbounded_channel();
    let backend = FakeBackend {
        rig: Arc::clone(&rig),
        services: services_tx,
    };
    let session =
        VoiceSession::start(VoiceConfig::default(), Arc::new(backend), recorder.clone()).unwrap();
    Harness {
        session,
        rig,
        recorder,
        services,
    }
}

fn start() -> Harness {
    start_with(Rig::default())
}

/// Open the transport and wait until `response.create` went out.
async fn open_and_request(h: &mut Harness) -> Service {
    let mut service = h.services.recv().await.unwrap();
    service.open();
    assert_eq!(service.next_command().await, "session.update");
    assert_eq!(service.next_control().await, "response.create");
    service
}

fn tone(len: usize) -> String {
    let samples: Vec<f32> = (0..len)
        .map(|n| 0.3 * (n as f32 * 0.05).sin())
        .collect();
    pcm::encode_base64(&pcm::encode_samples(&samples))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn full_turn_plays_gapless_and_closes() {
    let mut h = start();
    let mut service = h.services.recv().await.unwrap();

    // Nothing may be sent before the handshake completes.
    tokio::task::yield_now().await;
    assert!(service.commands.try_recv().is_err());

    service.open();
    assert_eq!(service.next_command().await, "session.update");

    h.rig.push_frame(0);
    assert_eq!(service.next_command().await, "input_audio_buffer.append");

    let requested_at = Instant::now();
    assert_eq!(service.next_control().await, "response.create");
    assert!(requested_at.elapsed() >= Duration::from_millis(250));

    for _ in 0..3 {
        service.delta("r1", &tone(4000));
    }
    service.done("r1");

    let state = h.session.wait().await;
    assert_eq!(state, ConnectionState::Idle);

    let spans = h.rig.spans();
    assert_eq!(spans.len(), 3);
    for pair in spans.windows(2) {
        assert_eq!(pair[1].start_frame, pair[0].end_frame, "gap between buffers");
    }
    let total: u64 = spans.iter().map(ScheduledSpan::frames).sum();
    assert_eq!(total, 12_000);
    assert_eq!(spans[2].end_frame - spans[0].start_frame, 12_000);

    assert_eq!(
        h.recorder.states(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::AwaitingResponse,
            ConnectionState::Streaming,
            ConnectionState::Open,
            ConnectionState::Idle,
        ]
    );
    assert_eq!(h.recorder.speaking(), vec![true, false]);
    assert!(h.recorder.errors().is_empty());
    assert!(h.recorder.levels.load(Ordering::SeqCst) > 0);

    assert_eq!(service.next_control().await, "close");
    assert_eq!(h.rig.capture_stops.load(Ordering::SeqCst), 1);
    assert_eq!(h.rig.output_opens.load(Ordering::SeqCst), 1);
    assert!(h.rig.output_released.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn transport_error_while_awaiting_reports_and_never_streams() {
    let mut h = start();
    let service = open_and_request(&mut h).await;

    service
        .events
        .send(TransportEvent::Error("connection reset".into()))
        .unwrap();

    assert_eq!(h.session.wait().await, ConnectionState::Errored);
    assert_eq!(h.recorder.errors(), vec![ErrorKind::Transport]);
    assert!(!h.recorder.states().contains(&ConnectionState::Streaming));
    assert_eq!(h.rig.capture_stops.load(Ordering::SeqCst), 1);
    assert_eq!(h.rig.output_opens.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn unexpected_close_is_a_transport_error() {
    let mut h = start();
    let service = open_and_request(&mut h).await;
    service.events.send(TransportEvent::Closed).unwrap();

    assert_eq!(h.session.wait().await, ConnectionState::Errored);
    assert_eq!(h.recorder.errors(), vec![ErrorKind::Transport]);
}

#[tokio::test(start_paused = true)]
async fn fallback_expiry_times_out_and_drains_transport() {
    let mut h = start();
    let mut service = open_and_request(&mut h).await;

    tokio::time::sleep(Duration::from_millis(5_100)).await;
    assert_eq!(h.recorder.errors(), vec![ErrorKind::Timeout]);
    assert_eq!(h.recorder.states().last(), Some(&ConnectionState::Errored));
    assert!(!h.session.is_finished(), "transport still draining");

    // Late audio is discarded; completion closes the transport.
    service.delta("r1", &tone(2400));
    service.done("r1");

    assert_eq!(h.session.wait().await, ConnectionState::Errored);
    assert_eq!(service.next_control().await, "close");
    assert_eq!(h.rig.output_opens.load(Ordering::SeqCst), 0);
    assert_eq!(h.recorder.errors(), vec![ErrorKind::Timeout]);
}

#[tokio::test(start_paused = true)]
async fn invalid_chunk_is_dropped_and_playback_continues() {
    let mut h = start();
    let service = open_and_request(&mut h).await;

    service.delta("r1", "!!!not-base64!!!");
    service.delta("r1", &tone(2400));
    service.done("r1");

    assert_eq!(h.session.wait().await, ConnectionState::Idle);
    let spans = h.rig.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].frames(), 2400);
    assert!(h.recorder.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn barge_in_cancels_and_discards_interrupted_audio() {
    let mut h = start();
    let mut service = open_and_request(&mut h).await;

    service.delta("r1", &tone(24_000));
    service.emit(r#"{"type":"input_audio_buffer.speech_started","audio_start_ms":10}"#);
    assert_eq!(service.next_control().await, "response.cancel");

    // Trailing audio and completion of the cancelled response.
    service.delta("r1", &tone(2400));
    service.done("r1");

    service.delta("r2", &tone(2400));
    service.done("r2");

    assert_eq!(h.session.wait().await, ConnectionState::Idle);

    let spans = h.rig.spans();
    assert_eq!(spans.len(), 2, "only r1's first chunk and r2 were scheduled");
    assert_eq!(spans[0].frames(), 24_000);
    assert_eq!(spans[1].frames(), 2400);
    assert_eq!(h.recorder.speaking(), vec![true, false, true, false]);

    let states = h.recorder.states();
    let barge = states
        .windows(2)
        .any(|w| w == [ConnectionState::Streaming, ConnectionState::AwaitingResponse]);
    assert!(barge, "states: {states:?}");
}

#[tokio::test(start_paused = true)]
async fn user_speaking_past_fallback_window_keeps_session() {
    let mut h = start();
    let mut service = open_and_request(&mut h).await;

    service.delta("r1", &tone(24_000));
    service.emit(r#"{"type":"input_audio_buffer.speech_started","audio_start_ms":10}"#);
    assert_eq!(service.next_control().await, "response.cancel");

    // A long user turn, well past the fallback window.
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert!(h.recorder.errors().is_empty());
    assert_eq!(
        h.recorder.states().last(),
        Some(&ConnectionState::AwaitingResponse)
    );
    assert!(!h.session.is_finished());

    service.emit(r#"{"type":"input_audio_buffer.speech_stopped","audio_end_ms":8000}"#);
    tokio::time::sleep(Duration::from_secs(2)).await;
    service.delta("r2", &tone(2400));
    service.done("r2");

    assert_eq!(h.session.wait().await, ConnectionState::Idle);
    assert!(h.recorder.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn silence_after_user_turn_times_out() {
    let mut h = start();
    let mut service = open_and_request(&mut h).await;

    service.delta("r1", &tone(24_000));
    service.emit(r#"{"type":"input_audio_buffer.speech_started","audio_start_ms":10}"#);
    assert_eq!(service.next_control().await, "response.cancel");
    service.emit(r#"{"type":"input_audio_buffer.speech_stopped","audio_end_ms":900}"#);

    tokio::time::sleep(Duration::from_millis(4_900)).await;
    assert!(h.recorder.errors().is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.recorder.errors(), vec![ErrorKind::Timeout]);
    assert_eq!(h.recorder.states().last(), Some(&ConnectionState::Errored));
}

#[tokio::test(start_paused = true)]
async fn end_is_idempotent() {
    let mut h = start();
    let mut service = h.services.recv().await.unwrap();
    service.open();
    assert_eq!(service.next_command().await, "session.update");

    assert_eq!(h.session.end().await, ConnectionState::Idle);
    assert_eq!(h.session.end().await, ConnectionState::Idle);
    assert!(h.session.is_finished());

    assert_eq!(service.next_command().await, "close");
    assert_eq!(h.rig.capture_stops.load(Ordering::SeqCst), 1);
    let states = h.recorder.states();
    assert_eq!(
        &states[states.len() - 2..],
        &[ConnectionState::Closing, ConnectionState::Idle]
    );
}

#[tokio::test(start_paused = true)]
async fn end_while_streaming_stops_playback() {
    let mut h = start();
    let service = open_and_request(&mut h).await;
    service.delta("r1", &tone(48_000));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.session.end().await, ConnectionState::Idle);
    assert_eq!(h.recorder.speaking(), vec![true, false]);
    assert!(h.rig.output_released.load(Ordering::SeqCst));
    assert!(h.recorder.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handle_cancels() {
    let mut h = start();
    let mut service = h.services.recv().await.unwrap();
    service.open();
    assert_eq!(service.next_command().await, "session.update");

    drop(h.session);
    assert_eq!(service.next_command().await, "close");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.rig.capture_stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn output_device_failure_is_reported() {
    let rig = Rig::default();
    rig.output_failures.store(usize::MAX, Ordering::SeqCst);
    let mut h = start_with(rig);
    let service = open_and_request(&mut h).await;

    service.delta("r1", &tone(2400));
    assert_eq!(h.session.wait().await, ConnectionState::Errored);
    assert_eq!(h.recorder.errors(), vec![ErrorKind::Device]);
    assert_eq!(h.rig.output_attempts.load(Ordering::SeqCst), 2);
    assert_eq!(h.rig.output_opens.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn output_acquisition_is_retried_once() {
    let rig = Rig::default();
    rig.output_failures.store(1, Ordering::SeqCst);
    let mut h = start_with(rig);
    let service = open_and_request(&mut h).await;

    service.delta("r1", &tone(2400));
    service.done("r1");

    assert_eq!(h.session.wait().await, ConnectionState::Idle);
    assert!(h.recorder.errors().is_empty());
    assert_eq!(h.rig.output_attempts.load(Ordering::SeqCst), 2);
    assert_eq!(h.rig.spans().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn output_stream_error_resumes_once() {
    let mut h = start();
    let service = open_and_request(&mut h).await;

    service.delta("r1", &tone(48_000));
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.rig.break_output();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.rig.resumes.load(Ordering::SeqCst), 1);
    assert!(h.recorder.errors().is_empty());
    assert_eq!(h.recorder.states().last(), Some(&ConnectionState::Streaming));

    h.rig.break_output();
    assert_eq!(h.session.wait().await, ConnectionState::Errored);
    assert_eq!(h.rig.resumes.load(Ordering::SeqCst), 1);
    assert_eq!(h.recorder.errors(), vec![ErrorKind::Device]);
    assert!(h.rig.output_released.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn failed_resume_disables_voice() {
    let rig = Rig::default();
    rig.fail_resume.store(true, Ordering::SeqCst);
    let mut h = start_with(rig);
    let service = open_and_request(&mut h).await;

    service.delta("r1", &tone(48_000));
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.rig.break_output();

    assert_eq!(h.session.wait().await, ConnectionState::Errored);
    assert_eq!(h.rig.resumes.load(Ordering::SeqCst), 1);
    assert_eq!(h.recorder.errors(), vec![ErrorKind::Device]);
    assert_eq!(h.recorder.speaking(), vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn capture_loss_is_reported() {
    let mut h = start();
    let mut service = h.services.recv().await.unwrap();
    service.open();
    assert_eq!(service.next_command().await, "session.update");

    h.rig.lose_capture();
    assert_eq!(h.session.wait().await, ConnectionState::Errored);
    assert_eq!(h.recorder.errors(), vec![ErrorKind::Device]);
    assert_eq!(service.next_command().await, "close");
}

#[tokio::test(start_paused = true)]
async fn connect_failure_is_reported() {
    let rig = Rig::default();
    rig.fail_connect.store(true, Ordering::SeqCst);
    let mut h = start_with(rig);

    assert_eq!(h.session.wait().await, ConnectionState::Errored);
    assert_eq!(h.recorder.errors(), vec![ErrorKind::Transport]);
    assert_eq!(
        h.recorder.states(),
        vec![ConnectionState::Connecting, ConnectionState::Errored]
    );
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let mut config = VoiceConfig::default();
    config.audio.frame_size = 0;
    let (services, _rx) = mpsc::unbounded_channel();
    let backend = FakeBackend {
        rig: Arc::new(Rig::default()),
        services,
    };
    let result = VoiceSession::start(config, Arc::new(backend), Arc::new(Recorder::default()));
    assert!(matches!(result, Err(VoiceError::Config(_))));
}
