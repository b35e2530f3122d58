//! Error types for varispeed
//!
//! One crate-wide error enum built with thiserror. Expected runtime conditions
//! (starvation, end of stream) are not represented here: they are state, not
//! failures.

use thiserror::Error;

/// Main error type for the playback engine
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or unreadable engine parameters
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Audio decoding errors
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Audio output device errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Sample rate conversion errors
    #[error("Resampler error: {0}")]
    Resample(String),

    /// Append that would take the decode buffer past its hard maximum
    #[error("Decode buffer overflow: cannot add {requested} bytes (size: {size}, max: {max})")]
    DecodeBufferOverflow {
        requested: usize,
        size: usize,
        max: usize,
    },

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid argument passed by the caller
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using the varispeed Error
pub type Result<T> = std::result::Result<T, Error>;
