//! Variable-speed audio playback.
//!
//! Decodes a file, time-stretches it to a caller-chosen speed without
//! changing pitch, and streams the result to an audio device. Decoding,
//! scaling and output run concurrently; [`engine::AudioEngine`] moves audio
//! between them and [`engine::VariableSpeedPlayer`] wraps a session in a
//! media-player style lifecycle.

pub mod config;
pub mod engine;
pub mod error;

pub use config::EngineParameters;
pub use error::{Error, Result};
