//! Engine parameters
//!
//! Everything a playback session needs to size its buffers and pace its loops.
//! Parameters come from built-in defaults, an optional TOML file, and finally
//! command-line overrides applied through [`EngineParametersBuilder`].

use crate::engine::decoder::CHUNK_BYTES;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Parameters for one playback session.
///
/// Sizes of the decode buffer are in bytes of 16-bit PCM; everything else is
/// in frames, seconds or milliseconds as named.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineParameters {
    /// Output channel count (1 or 2 in practice)
    pub channels: usize,

    /// Output sample rate in Hz
    pub sample_rate: u32,

    /// Frames per output buffer handed to the device
    pub target_frames: usize,

    /// Maximum number of output buffers queued on the device at once
    pub max_play_buffer_count: usize,

    /// Scaler analysis window in seconds
    pub window_duration: f32,

    /// Scaler crossfade length in seconds
    pub window_overlap_duration: f32,

    /// Playback speed at session start (1.0 = normal)
    pub initial_rate: f32,

    /// Decode buffer starting capacity in bytes
    pub decode_buffer_initial_size: usize,

    /// Decode buffer hard maximum in bytes; the decoder is throttled at this size
    pub decode_buffer_max_size: usize,

    /// Offset into the source at which playback begins
    pub start_position_millis: u64,

    /// Pipeline loop and backpressure poll interval
    pub tick_micros: u64,

    /// Prefetch status poll interval
    pub prefetch_poll_millis: u64,
}

impl Default for EngineParameters {
    fn default() -> Self {
        Self {
            channels: 2,
            sample_rate: 44100,
            target_frames: 1000,
            max_play_buffer_count: 2,
            window_duration: 0.08,
            window_overlap_duration: 0.008,
            initial_rate: 1.0,
            decode_buffer_initial_size: 5 * 1024,
            decode_buffer_max_size: 20 * 1024,
            start_position_millis: 0,
            tick_micros: 1000,
            prefetch_poll_millis: 10,
        }
    }
}

impl EngineParameters {
    pub fn builder() -> EngineParametersBuilder {
        EngineParametersBuilder::default()
    }

    /// Parse parameters from TOML text; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let params: EngineParameters = toml::from_str(text)?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading engine parameters from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject parameter sets the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(Error::Config("channels must be at least 1".into()));
        }
        if self.sample_rate == 0 {
            return Err(Error::Config("sample_rate must be positive".into()));
        }
        if self.target_frames == 0 {
            return Err(Error::Config("target_frames must be at least 1".into()));
        }
        if self.max_play_buffer_count == 0 {
            return Err(Error::Config(
                "max_play_buffer_count must be at least 1".into(),
            ));
        }
        if !(self.initial_rate.is_finite() && self.initial_rate > 0.0) {
            return Err(Error::Config(format!(
                "initial_rate must be a positive number, got {}",
                self.initial_rate
            )));
        }
        if !(self.window_duration > 0.0 && self.window_overlap_duration > 0.0) {
            return Err(Error::Config("scaler window durations must be positive".into()));
        }
        if self.window_overlap_duration >= self.window_duration {
            return Err(Error::Config(
                "window_overlap_duration must be shorter than window_duration".into(),
            ));
        }
        if self.decode_buffer_initial_size == 0 {
            return Err(Error::Config(
                "decode_buffer_initial_size must be at least 1 byte".into(),
            ));
        }
        if self.decode_buffer_max_size < self.decode_buffer_initial_size {
            return Err(Error::Config(format!(
                "decode_buffer_max_size ({}) is smaller than decode_buffer_initial_size ({})",
                self.decode_buffer_max_size, self.decode_buffer_initial_size
            )));
        }
        if self.decode_buffer_max_size < CHUNK_BYTES.max(self.frame_size_in_bytes()) {
            return Err(Error::Config(format!(
                "decode_buffer_max_size ({}) cannot hold one {}-byte decoder chunk",
                self.decode_buffer_max_size, CHUNK_BYTES
            )));
        }
        Ok(())
    }

    /// Bytes per frame of 16-bit PCM.
    pub fn frame_size_in_bytes(&self) -> usize {
        self.channels * 2
    }

    pub fn tick(&self) -> Duration {
        Duration::from_micros(self.tick_micros)
    }

    pub fn prefetch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.prefetch_poll_millis)
    }
}

/// Builder for [`EngineParameters`], starting from the defaults.
#[derive(Debug, Clone, Default)]
pub struct EngineParametersBuilder {
    params: EngineParameters,
}

impl EngineParametersBuilder {
    /// Start from an existing parameter set (e.g. one loaded from TOML).
    pub fn from_params(params: EngineParameters) -> Self {
        Self { params }
    }

    pub fn channels(mut self, channels: usize) -> Self {
        self.params.channels = channels;
        self
    }

    pub fn sample_rate(mut self, sample_rate: u32) -> Self {
        self.params.sample_rate = sample_rate;
        self
    }

    pub fn target_frames(mut self, target_frames: usize) -> Self {
        self.params.target_frames = target_frames;
        self
    }

    pub fn max_play_buffer_count(mut self, count: usize) -> Self {
        self.params.max_play_buffer_count = count;
        self
    }

    pub fn window_duration(mut self, seconds: f32) -> Self {
        self.params.window_duration = seconds;
        self
    }

    pub fn window_overlap_duration(mut self, seconds: f32) -> Self {
        self.params.window_overlap_duration = seconds;
        self
    }

    pub fn initial_rate(mut self, rate: f32) -> Self {
        self.params.initial_rate = rate;
        self
    }

    pub fn decode_buffer_initial_size(mut self, bytes: usize) -> Self {
        self.params.decode_buffer_initial_size = bytes;
        self
    }

    pub fn decode_buffer_max_size(mut self, bytes: usize) -> Self {
        self.params.decode_buffer_max_size = bytes;
        self
    }

    pub fn start_position_millis(mut self, millis: u64) -> Self {
        self.params.start_position_millis = millis;
        self
    }

    pub fn tick_micros(mut self, micros: u64) -> Self {
        self.params.tick_micros = micros;
        self
    }

    pub fn prefetch_poll_millis(mut self, millis: u64) -> Self {
        self.params.prefetch_poll_millis = millis;
        self
    }

    pub fn build(self) -> Result<EngineParameters> {
        self.params.validate()?;
        Ok(self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let params = EngineParameters::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.channels, 2);
        assert_eq!(params.sample_rate, 44100);
        assert_eq!(params.target_frames, 1000);
        assert_eq!(params.max_play_buffer_count, 2);
        assert_eq!(params.decode_buffer_initial_size, 5 * 1024);
        assert_eq!(params.decode_buffer_max_size, 20 * 1024);
        assert_eq!(params.frame_size_in_bytes(), 4);
    }

    #[test]
    fn test_builder_overrides() {
        let params = EngineParameters::builder()
            .channels(1)
            .sample_rate(11025)
            .initial_rate(1.5)
            .start_position_millis(2500)
            .build()
            .unwrap();

        assert_eq!(params.channels, 1);
        assert_eq!(params.sample_rate, 11025);
        assert_eq!(params.initial_rate, 1.5);
        assert_eq!(params.start_position_millis, 2500);
        assert_eq!(params.target_frames, 1000);
    }

    #[test]
    fn test_builder_rejects_invalid() {
        assert!(EngineParameters::builder().channels(0).build().is_err());
        assert!(EngineParameters::builder().target_frames(0).build().is_err());
        assert!(EngineParameters::builder().initial_rate(0.0).build().is_err());
        assert!(EngineParameters::builder().initial_rate(f32::NAN).build().is_err());
        assert!(EngineParameters::builder()
            .decode_buffer_initial_size(4096)
            .decode_buffer_max_size(1024)
            .build()
            .is_err());
        assert!(EngineParameters::builder()
            .window_duration(0.01)
            .window_overlap_duration(0.02)
            .build()
            .is_err());
    }

    #[test]
    fn test_decode_buffer_must_hold_a_chunk() {
        let result = EngineParameters::builder()
            .decode_buffer_initial_size(1024)
            .decode_buffer_max_size(2000)
            .build();
        assert!(matches!(result, Err(Error::Config(_))));

        let params = EngineParameters::builder()
            .decode_buffer_initial_size(1024)
            .decode_buffer_max_size(CHUNK_BYTES)
            .build()
            .unwrap();
        assert_eq!(params.decode_buffer_max_size, 2304);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let params = EngineParameters::from_toml_str(
            r#"
            sample_rate = 48000
            target_frames = 1152
            decode_buffer_max_size = 8192
            "#,
        )
        .unwrap();

        assert_eq!(params.sample_rate, 48000);
        assert_eq!(params.target_frames, 1152);
        assert_eq!(params.decode_buffer_max_size, 8192);
        assert_eq!(params.channels, 2);
        assert_eq!(params.tick_micros, 1000);
    }

    #[test]
    fn test_toml_validation_error() {
        let result = EngineParameters::from_toml_str("channels = 0");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_toml_syntax_error() {
        let result = EngineParameters::from_toml_str("channels = [");
        assert!(matches!(result, Err(Error::Toml(_))));
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "channels = 1\ninitial_rate = 0.75").unwrap();

        let params = EngineParameters::from_toml_file(file.path()).unwrap();
        assert_eq!(params.channels, 1);
        assert_eq!(params.initial_rate, 0.75);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = EngineParameters::from_toml_file("/nonexistent/varispeed.toml");
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
