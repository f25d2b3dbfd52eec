//! Ownership and teardown of everything a session holds.
//!
//! [`Lifecycle::end_session`] releases resources in a fixed order: capture,
//! timers, transport, then playback and the output device. Each step logs
//! and swallows its own failure so the next one still runs. Calling it again
//! finds nothing left to release.

use crate::audio::capture::CaptureHandle;
use crate::pipeline::scheduler::PlaybackScheduler;
use crate::session::transport::TransportCommand;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};

/// The controller's one-shot timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Between `session.update` and `response.create`.
    Settle,
    /// Bounds the wait for the first audio delta.
    Fallback,
    /// Between turn completion and closing the transport.
    Grace,
}

/// Armed timers as deadlines on the tokio clock.
#[derive(Default)]
pub struct Timers {
    settle: Option<Pin<Box<Sleep>>>,
    fallback: Option<Pin<Box<Sleep>>>,
    grace: Option<Pin<Box<Sleep>>>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, kind: TimerKind) -> &mut Option<Pin<Box<Sleep>>> {
        match kind {
            TimerKind::Settle => &mut self.settle,
            TimerKind::Fallback => &mut self.fallback,
            TimerKind::Grace => &mut self.grace,
        }
    }

    /// Arm (or re-arm) a timer.
    pub fn arm(&mut self, kind: TimerKind, after: Duration) {
        debug!(?kind, ?after, "timer armed");
        *self.slot(kind) = Some(Box::pin(tokio::time::sleep(after)));
    }

    /// Disarm a timer. Returns whether it was armed.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.slot(kind).take().is_some()
    }

    /// Disarm every timer. Returns how many were armed.
    pub fn cancel_all(&mut self) -> usize {
        [TimerKind::Settle, TimerKind::Fallback, TimerKind::Grace]
            .into_iter()
            .filter(|&kind| self.cancel(kind))
            .count()
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::Settle => self.settle.is_some(),
            TimerKind::Fallback => self.fallback.is_some(),
            TimerKind::Grace => self.grace.is_some(),
        }
    }

    fn earliest(&mut self) -> Option<(TimerKind, &mut Pin<Box<Sleep>>)> {
        let mut best: Option<(TimerKind, Instant)> = None;
        for (kind, slot) in [
            (TimerKind::Settle, &self.settle),
            (TimerKind::Fallback, &self.fallback),
            (TimerKind::Grace, &self.grace),
        ] {
            if let Some(sleep) = slot {
                let deadline = sleep.deadline();
                if best.is_none_or(|(_, d)| deadline < d) {
                    best = Some((kind, deadline));
                }
            }
        }
        let (kind, _) = best?;
        self.slot(kind).as_mut().map(|sleep| (kind, sleep))
    }

    /// Wait for the earliest armed timer and disarm it.
    ///
    /// Pending forever when nothing is armed, so it can sit in a `select!`.
    pub async fn next_expiry(&mut self) -> TimerKind {
        let Some((kind, sleep)) = self.earliest() else {
            return std::future::pending().await;
        };
        sleep.as_mut().await;
        self.cancel(kind);
        kind
    }
}

/// What one [`Lifecycle::end_session`] call actually released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub capture_stopped: bool,
    pub timers_cancelled: usize,
    pub transport_closed: bool,
    pub playback_halted: bool,
    pub output_released: bool,
}

impl TeardownReport {
    /// Whether this call released nothing.
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// Resources owned by one session.
pub struct Lifecycle {
    capture: Option<Box<dyn CaptureHandle>>,
    pub timers: Timers,
    transport: Option<mpsc::UnboundedSender<TransportCommand>>,
    pub playback: PlaybackScheduler,
    ended: bool,
}

impl Lifecycle {
    pub fn new(playback: PlaybackScheduler) -> Self {
        Self {
            capture: None,
            timers: Timers::new(),
            transport: None,
            playback,
            ended: false,
        }
    }

    pub fn set_capture(&mut self, capture: Box<dyn CaptureHandle>) {
        self.capture = Some(capture);
    }

    pub fn capture_running(&self) -> bool {
        self.capture.is_some()
    }

    pub fn set_transport(&mut self, commands: mpsc::UnboundedSender<TransportCommand>) {
        self.transport = Some(commands);
    }

    pub fn transport(&self) -> Option<&mpsc::UnboundedSender<TransportCommand>> {
        self.transport.as_ref()
    }

    pub fn has_ended(&self) -> bool {
        self.ended
    }

    /// Stop the microphone. Returns whether it was running.
    pub fn stop_capture(&mut self) -> bool {
        let Some(mut capture) = self.capture.take() else {
            return false;
        };
        if let Err(e) = capture.stop() {
            warn!("capture did not stop cleanly: {e}");
        }
        true
    }

    /// Ask the socket task to close. Returns whether a transport was held.
    pub fn close_transport(&mut self) -> bool {
        let Some(commands) = self.transport.take() else {
            return false;
        };
        if commands.send(TransportCommand::Close).is_err() {
            debug!("transport task already finished");
        }
        true
    }

    /// Release everything. Safe to call from any state, any number of times.
    pub fn end_session(&mut self) -> TeardownReport {
        let report = TeardownReport {
            capture_stopped: self.stop_capture(),
            timers_cancelled: self.timers.cancel_all(),
            transport_closed: self.close_transport(),
            playback_halted: {
                let was_halted = self.playback.is_halted();
                self.playback.halt();
                !was_halted
            },
            output_released: self.playback.release_output(),
        };
        if !self.ended {
            self.ended = true;
            info!(?report, "session resources released");
        } else if !report.is_noop() {
            debug!(?report, "late resources released");
        }
        report
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.end_session();
    }
}
