pub mod cpal_backend;

use crate::engine::buffer::pool::SharedPlayBuffer;
use crate::error::Result;

/// Invoked once per finished buffer, in submission order.
pub type CompletionCallback = Box<dyn Fn() + Send + Sync>;

/// Plays queued buffers to a device.
///
/// Not `Send`: device streams are typically tied to the thread that built
/// them, so an output lives and dies on the pipeline thread.
pub trait OutputSink {
    fn set_completion_callback(&mut self, callback: CompletionCallback);

    /// Detaches the callback. No completion fires after this returns.
    fn clear_completion_callback(&mut self);

    /// Starts the audio output stream.
    fn start(&mut self) -> Result<()>;

    /// Pauses the audio output stream.
    fn pause(&mut self) -> Result<()>;

    /// Stops the stream and drops anything still queued without completing it.
    fn stop(&mut self) -> Result<()>;

    /// Queues a buffer behind those already submitted.
    fn enqueue(&mut self, buffer: SharedPlayBuffer) -> Result<()>;
}

/// Creates outputs once playback is first requested.
pub trait OutputFactory: Send + Sync {
    fn create(&self, sample_rate: u32, channels: usize) -> Result<Box<dyn OutputSink>>;
}
