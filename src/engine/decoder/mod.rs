pub mod symphonia_decoder;

use std::path::Path;
use std::sync::Arc;

use crate::config::EngineParameters;
use crate::error::Result;

/// Size of one delivery to the sink: 1152 16-bit samples.
pub const CHUNK_BYTES: usize = 1152 * 2;

/// Chunks a paused decoder stages ahead of playback.
pub const PREFETCH_CHUNKS: usize = 4;

/// Terminal notifications from a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    /// The last chunk has been delivered.
    EndOfStream,
    /// Decoding failed and no more data will arrive.
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchState {
    Underflow,
    SufficientData,
    Error,
}

/// Snapshot of how much a paused decoder has staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchStatus {
    /// Fill level in permille of the prefetch target.
    pub fill_level: u32,
    pub state: PrefetchState,
}

impl PrefetchStatus {
    pub fn new(fill_level: u32, state: PrefetchState) -> Self {
        Self {
            fill_level: fill_level.min(1000),
            state,
        }
    }
}

/// Receiver of decoded audio.
///
/// Called from the decoder's own thread. `on_decoded` may block to apply
/// backpressure; the decoder makes no progress until it returns.
pub trait DecodeSink: Send + Sync {
    /// Receives 16-bit little-endian interleaved PCM at the engine rate.
    fn on_decoded(&self, bytes: &[u8]);

    fn on_event(&self, event: DecodeEvent);
}

/// A decoding service for one source.
///
/// Starts paused. While paused it prefetches; while playing it pushes data to
/// the registered sink as fast as the sink accepts it.
pub trait DecoderService: Send {
    fn set_sink(&mut self, sink: Arc<dyn DecodeSink>);

    /// Detaches the sink. No delivery starts after this returns.
    fn clear_sink(&mut self);

    fn play(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    /// Stops decoding for good.
    fn stop(&mut self) -> Result<()>;

    /// Repositions the source, discarding anything staged.
    fn seek(&mut self, position_millis: u64) -> Result<()>;

    /// Length of the source, if the container reports one.
    fn duration_millis(&self) -> Option<u64>;

    fn prefetch_status(&self) -> PrefetchStatus;
}

/// Opens decoders producing audio in the engine's format.
pub trait DecoderFactory: Send + Sync {
    fn open(&self, source: &Path, params: &EngineParameters) -> Result<Box<dyn DecoderService>>;
}
