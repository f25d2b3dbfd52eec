//! Configuration types for the voice session core.

use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for a voice session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Values sent to the remote service in `session.update`.
    pub session: SessionConfig,
    /// Remote voice service connection.
    pub transport: TransportConfig,
    /// Controller delays and the fallback timer.
    pub timing: TimingConfig,
    /// Amplitude envelope for UI consumers.
    pub envelope: EnvelopeConfig,
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Wire sample rate in Hz, used for both directions.
    pub sample_rate: u32,
    /// Samples per outbound frame.
    pub frame_size: usize,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// Buffers handed to the output device ahead of the one rendering.
    ///
    /// 1 schedules strictly on completion; 2 keeps the next buffer queued on
    /// the device so completion latency never opens a gap.
    pub playback_lookahead: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            frame_size: 2048,
            input_device: None,
            output_device: None,
            playback_lookahead: 2,
        }
    }
}

/// Immutable description of one conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Spoken instructions for the interviewer.
    pub instructions: String,
    /// Named voice identity.
    pub voice: String,
    /// Format of audio sent to the service.
    pub input_audio_format: String,
    /// Format of audio received from the service.
    pub output_audio_format: String,
    /// Server-side turn detection parameters.
    pub turn_detection: TurnDetectionConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            instructions: "You are a friendly interviewer. Ask one question at a time and keep \
                           your answers short."
                .to_owned(),
            voice: "alloy".to_owned(),
            input_audio_format: "pcm16".to_owned(),
            output_audio_format: "pcm16".to_owned(),
            turn_detection: TurnDetectionConfig::default(),
        }
    }
}

/// Turn detection is configured here but runs on the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnDetectionConfig {
    /// Detector type understood by the service.
    pub kind: String,
    /// Energy threshold in \[0, 1\].
    pub threshold: f32,
    /// Audio kept before detected speech, in ms.
    pub prefix_padding_ms: u32,
    /// Silence before a turn is considered complete, in ms.
    pub silence_duration_ms: u32,
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_owned(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

/// Remote voice service connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket endpoint.
    pub url: String,
    /// Model name appended as the `model` query parameter (empty = omitted).
    pub model: String,
    /// Environment variable holding the bearer token (empty = no auth header).
    pub api_key_env: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime".to_owned(),
            model: "gpt-4o-realtime-preview".to_owned(),
            api_key_env: "OPENAI_API_KEY".to_owned(),
        }
    }
}

/// Controller delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay between `session.update` and `response.create`.
    pub settle_delay_ms: u64,
    /// Longest the UI waits for the first audio delta.
    pub fallback_timeout_ms: u64,
    /// Delay between turn completion and closing the transport.
    pub close_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 250,
            fallback_timeout_ms: 5_000,
            close_grace_ms: 500,
        }
    }
}

impl TimingConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// Amplitude envelope settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeConfig {
    /// Render ticks per second.
    pub tick_hz: u32,
    /// Rise time constant in ms.
    pub attack_ms: f32,
    /// Fall time constant in ms.
    pub release_ms: f32,
    /// FFT window for microphone analysis (power of two).
    pub fft_size: usize,
    /// Upper edge of the analysed voice band in Hz.
    pub voice_band_hz: f32,
    /// Seed for the synthetic speech waveform noise.
    pub seed: u64,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            tick_hz: 60,
            attack_ms: 40.0,
            release_ms: 110.0,
            fft_size: 512,
            voice_band_hz: 4_000.0,
            seed: 0x5eed,
        }
    }
}

impl EnvelopeConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_hz.max(1)))
    }
}

impl VoiceConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| VoiceError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| VoiceError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/viva/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp/viva-config"))
            .join("viva")
            .join("config.toml")
    }

    /// Reject values the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(VoiceError::Config("audio.sample_rate must be > 0".into()));
        }
        if self.audio.frame_size == 0 {
            return Err(VoiceError::Config("audio.frame_size must be > 0".into()));
        }
        if self.audio.playback_lookahead == 0 {
            return Err(VoiceError::Config(
                "audio.playback_lookahead must be >= 1".into(),
            ));
        }
        if self.envelope.tick_hz == 0 {
            return Err(VoiceError::Config("envelope.tick_hz must be > 0".into()));
        }
        if !self.envelope.fft_size.is_power_of_two() || self.envelope.fft_size < 16 {
            return Err(VoiceError::Config(
                "envelope.fft_size must be a power of two >= 16".into(),
            ));
        }
        let time_constant_ok = |ms: f32| ms.is_finite() && ms > 0.0 && ms <= 60_000.0;
        if !time_constant_ok(self.envelope.attack_ms) || !time_constant_ok(self.envelope.release_ms)
        {
            return Err(VoiceError::Config(
                "envelope time constants must be within (0, 60000] ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.session.turn_detection.threshold) {
            return Err(VoiceError::Config(
                "session.turn_detection.threshold must be within [0, 1]".into(),
            ));
        }
        if self.transport.url.is_empty() {
            return Err(VoiceError::Config("transport.url is empty".into()));
        }
        Ok(())
    }
}
