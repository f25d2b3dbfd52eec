//! Smoothed amplitude envelope for UI consumers.
//!
//! One [`EnvelopeExtractor::tick`] per render frame yields a value in
//! \[0, 1\]. While the user speaks the target comes from a spectrum of the
//! latest capture window, weighted towards the low voice band. While the
//! remote voice speaks there is no energy measurement of the synthesized
//! audio, so a seeded synthetic speech-like waveform stands in for it.

use crate::audio::pcm;
use crate::config::EnvelopeConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

/// Which side of the conversation drives the envelope this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeSource {
    /// Nobody is speaking; the envelope decays to zero.
    Silent,
    /// The user is the active speaker.
    Microphone,
    /// The remote voice is playing.
    Remote,
}

/// Exponential smoothing with separate rise and fall time constants.
#[derive(Debug, Clone)]
pub struct Smoother {
    value: f32,
    attack: Duration,
    release: Duration,
}

impl Smoother {
    pub fn new(attack: Duration, release: Duration) -> Self {
        Self {
            value: 0.0,
            attack,
            release,
        }
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    /// Move towards `target` over `dt`.
    pub fn step(&mut self, target: f32, dt: Duration) -> f32 {
        let target = target.clamp(0.0, 1.0);
        let tau = if target > self.value {
            self.attack
        } else {
            self.release
        };
        let tau = tau.as_secs_f32().max(f32::EPSILON);
        let alpha = 1.0 - (-dt.as_secs_f32() / tau).exp();
        self.value = (self.value + alpha * (target - self.value)).clamp(0.0, 1.0);
        self.value
    }
}

/// dB floor and ceiling mapped onto \[0, 1\].
const MIN_DB: f32 = -90.0;
const MAX_DB: f32 = -20.0;

/// Voice-weighted spectrum level of the most recent capture window.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    weights: Vec<f32>,
    weight_sum: f32,
    recent: VecDeque<f32>,
    scratch: Vec<Complex32>,
    /// Normalizes magnitudes so a full-scale sine peaks near 0 dB.
    gain: f32,
}

impl SpectrumAnalyzer {
    pub fn new(fft_size: usize, sample_rate: u32, voice_band_hz: f32) -> Self {
        let size = fft_size.max(16);
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(size);

        let window: Vec<f32> = (0..size)
            .map(|n| 0.5 * (1.0 - (2.0 * PI * n as f32 / (size - 1) as f32).cos()))
            .collect();
        let gain = 2.0 / window.iter().sum::<f32>();

        // Bins 1..=top cover the voice band; lower bins weigh more.
        let bin_hz = sample_rate as f32 / size as f32;
        let top = ((voice_band_hz / bin_hz) as usize).clamp(1, size / 2);
        let weights: Vec<f32> = (1..=top)
            .map(|k| 1.0 / (1.0 + 3.0 * k as f32 / top as f32))
            .collect();
        let weight_sum = weights.iter().sum();

        Self {
            fft,
            window,
            weights,
            weight_sum,
            recent: VecDeque::with_capacity(size),
            scratch: vec![Complex32::new(0.0, 0.0); size],
            gain,
        }
    }

    /// Keep the newest samples for the next analysis.
    pub fn push(&mut self, samples: &[f32]) {
        let size = self.window.len();
        for &s in samples {
            if self.recent.len() == size {
                self.recent.pop_front();
            }
            self.recent.push_back(s);
        }
    }

    /// Weighted average of per-bin levels in \[0, 1\].
    pub fn level(&mut self) -> f32 {
        let size = self.window.len();
        if self.recent.len() < size {
            return 0.0;
        }
        for (slot, (&s, &w)) in self
            .scratch
            .iter_mut()
            .zip(self.recent.iter().zip(self.window.iter()))
        {
            *slot = Complex32::new(s * w, 0.0);
        }
        self.fft.process(&mut self.scratch);

        let weighted: f32 = self
            .weights
            .iter()
            .enumerate()
            .map(|(i, &w)| {
                let magnitude = self.scratch[i + 1].norm() * self.gain;
                let db = 20.0 * magnitude.max(1e-9).log10();
                w * ((db - MIN_DB) / (MAX_DB - MIN_DB)).clamp(0.0, 1.0)
            })
            .sum();
        (weighted / self.weight_sum).clamp(0.0, 1.0)
    }
}

/// Deterministic, speech-like level used while the remote voice plays.
pub struct SyntheticVoice {
    t: f32,
    rng: StdRng,
}

/// (amplitude, frequency Hz, phase) of each component.
const SYNTH_PARTIALS: [(f32, f32, f32); 3] = [(0.22, 1.7, 0.0), (0.15, 3.1, 1.3), (0.08, 5.3, 2.1)];
const SYNTH_BASE: f32 = 0.45;
const SYNTH_NOISE: f32 = 0.05;

impl SyntheticVoice {
    pub fn new(seed: u64) -> Self {
        Self {
            t: 0.0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn level(&mut self, dt: Duration) -> f32 {
        self.t += dt.as_secs_f32();
        let tone: f32 = SYNTH_PARTIALS
            .iter()
            .map(|&(amp, freq, phase)| amp * (2.0 * PI * freq * self.t + phase).sin())
            .sum();
        let noise = self.rng.gen_range(-SYNTH_NOISE..=SYNTH_NOISE);
        (SYNTH_BASE + tone + noise).clamp(0.0, 1.0)
    }
}

/// Produces one smoothed envelope sample per render tick.
pub struct EnvelopeExtractor {
    smoother: Smoother,
    analyzer: SpectrumAnalyzer,
    synth: SyntheticVoice,
}

impl EnvelopeExtractor {
    pub fn new(config: &EnvelopeConfig, sample_rate: u32) -> Self {
        Self {
            smoother: Smoother::new(
                Duration::from_secs_f32(config.attack_ms / 1000.0),
                Duration::from_secs_f32(config.release_ms / 1000.0),
            ),
            analyzer: SpectrumAnalyzer::new(config.fft_size, sample_rate, config.voice_band_hz),
            synth: SyntheticVoice::new(config.seed),
        }
    }

    /// Tap an outbound capture frame.
    pub fn observe_capture(&mut self, frame: &[i16]) {
        self.analyzer.push(&pcm::decode_samples(frame));
    }

    /// Advance one render tick.
    pub fn tick(&mut self, source: EnvelopeSource, dt: Duration) -> f32 {
        let target = match source {
            EnvelopeSource::Silent => 0.0,
            EnvelopeSource::Microphone => self.analyzer.level(),
            EnvelopeSource::Remote => self.synth.level(dt),
        };
        self.smoother.step(target, dt)
    }

    pub fn value(&self) -> f32 {
        self.smoother.value()
    }
}
