use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, error, info, trace, warn};

use crate::config::EngineParameters;
use crate::engine::buffer::pool::PlayBufferPool;
use crate::engine::buffer::{DecodeRingBuffer, SharedDecodeBuffer};
use crate::engine::decoder::{DecodeEvent, DecodeSink, DecoderService, PrefetchState};
use crate::engine::dsp::TimeScaler;
use crate::engine::lock;
use crate::engine::output::{OutputFactory, OutputSink};
use crate::engine::scaler_adapter::ScalerAdapter;
use crate::error::{Error, Result};

/// Where a session is in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    NotStarted,
    Prefetching,
    AwaitingStartSignal,
    Streaming,
    Stopping,
    Finished,
}

struct ControlFlags {
    start_requested: bool,
    stop_requested: bool,
    end_of_decode: bool,
    total_duration_millis: u64,
    state: PipelineState,
}

/// One playback session: moves audio from decoder to output through the
/// time scaler.
///
/// The decoder pushes into the decode buffer from its own thread (the engine
/// is its [`DecodeSink`]); the pipeline loop running in
/// [`play_from_source`](Self::play_from_source) scales that audio into pooled
/// output buffers and hands them to the output, whose completion callback
/// recycles them.
pub struct AudioEngine {
    params: EngineParameters,
    decode: SharedDecodeBuffer,
    pool: Arc<PlayBufferPool>,
    flags: Mutex<ControlFlags>,
    scaler: Mutex<ScalerAdapter>,
    outputs: Arc<dyn OutputFactory>,
    /// Set at teardown so a decoder callback still in flight stops waiting.
    detached: AtomicBool,
}

impl AudioEngine {
    pub fn new(
        params: EngineParameters,
        scaler: Box<dyn TimeScaler>,
        outputs: Arc<dyn OutputFactory>,
    ) -> Result<Self> {
        params.validate()?;

        let mut adapter = ScalerAdapter::new(scaler, params.channels, params.target_frames);
        adapter.set_speed(params.initial_rate);

        Ok(Self {
            decode: SharedDecodeBuffer::new(DecodeRingBuffer::new(
                params.decode_buffer_initial_size,
                params.decode_buffer_max_size,
            )),
            pool: Arc::new(PlayBufferPool::new(
                params.target_frames,
                params.channels,
                params.max_play_buffer_count,
            )),
            flags: Mutex::new(ControlFlags {
                start_requested: false,
                stop_requested: false,
                end_of_decode: false,
                total_duration_millis: 0,
                state: PipelineState::NotStarted,
            }),
            scaler: Mutex::new(adapter),
            outputs,
            detached: AtomicBool::new(false),
            params,
        })
    }

    pub fn params(&self) -> &EngineParameters {
        &self.params
    }

    /// Asks the pipeline to open the output and start streaming.
    pub fn request_start(&self) {
        lock(&self.flags).start_requested = true;
    }

    /// Asks the session to end. Never cleared.
    pub fn request_stop(&self) {
        lock(&self.flags).stop_requested = true;
    }

    pub fn set_speed(&self, speed: f32) -> Result<()> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "speed must be a positive number, got {}",
                speed
            )));
        }
        lock(&self.scaler).set_speed(speed);
        debug!("Speed set to {}", speed);
        Ok(())
    }

    pub fn speed(&self) -> f32 {
        lock(&self.scaler).speed()
    }

    /// Source position of the audio consumed so far.
    pub fn current_position_millis(&self) -> u64 {
        let advanced = self.decode.lock().total_advanced_count();
        advanced * 1000 / u64::from(self.params.sample_rate) / self.params.channels as u64
            + self.params.start_position_millis
    }

    /// Source length, known once prefetching completes; 0 before that.
    pub fn total_duration_millis(&self) -> u64 {
        lock(&self.flags).total_duration_millis
    }

    pub fn state(&self) -> PipelineState {
        lock(&self.flags).state
    }

    pub fn is_stop_requested(&self) -> bool {
        lock(&self.flags).stop_requested
    }

    pub fn is_end_of_decode_reached(&self) -> bool {
        lock(&self.flags).end_of_decode
    }

    /// Records that no more decoded audio will arrive.
    pub fn mark_end_of_decode(&self) {
        lock(&self.flags).end_of_decode = true;
    }

    /// True once stopped, or once everything decoded has been played out.
    pub fn is_finished(&self) -> bool {
        let (stop, end_of_decode) = {
            let flags = lock(&self.flags);
            (flags.stop_requested, flags.end_of_decode)
        };
        stop || (end_of_decode && self.pool.in_flight_count() == 0 && !self.has_decoded_audio())
    }

    pub fn decode_buffer(&self) -> &SharedDecodeBuffer {
        &self.decode
    }

    pub fn play_buffers(&self) -> &PlayBufferPool {
        &self.pool
    }

    fn set_state(&self, state: PipelineState) {
        let previous = std::mem::replace(&mut lock(&self.flags).state, state);
        if previous != state {
            debug!("Pipeline {:?} -> {:?}", previous, state);
        }
    }

    fn take_start_request(&self) -> bool {
        std::mem::take(&mut lock(&self.flags).start_requested)
    }

    fn has_decoded_audio(&self) -> bool {
        !self.decode.lock().is_empty()
    }

    fn should_abandon_wait(&self) -> bool {
        self.detached.load(Ordering::Acquire) || self.is_stop_requested()
    }

    /// Runs a whole session on `decoder`, returning when it finishes.
    ///
    /// Prefetches, starts the decoder, then runs the pipeline loop. The
    /// decoder is detached and stopped before returning, whether the
    /// session ended normally or with an error.
    pub fn play_from_source(self: &Arc<Self>, mut decoder: Box<dyn DecoderService>) -> Result<()> {
        self.decode.lock().clear();
        self.decode.notify_drained();
        self.detached.store(false, Ordering::Release);

        let sink: Arc<dyn DecodeSink> = self.clone();
        decoder.set_sink(sink);

        let result = self.prefetch_and_stream(decoder.as_mut());
        if let Err(e) = &result {
            error!("Playback failed: {}", e);
        }

        self.detached.store(true, Ordering::Release);
        decoder.clear_sink();
        if let Err(e) = decoder.stop() {
            warn!("Failed to stop decoder: {}", e);
        }
        self.pool.release_all();
        self.set_state(PipelineState::Finished);
        result
    }

    fn prefetch_and_stream(&self, decoder: &mut dyn DecoderService) -> Result<()> {
        self.set_state(PipelineState::Prefetching);
        decoder.seek(self.params.start_position_millis)?;
        decoder.pause()?;

        let poll = self.params.prefetch_poll_interval();
        loop {
            if self.is_stop_requested() {
                debug!("Stop requested during prefetch");
                return Ok(());
            }
            let status = decoder.prefetch_status();
            match status.state {
                PrefetchState::SufficientData => break,
                PrefetchState::Error => {
                    warn!("Prefetch failed at {}‰", status.fill_level);
                    self.mark_end_of_decode();
                    break;
                }
                PrefetchState::Underflow => {
                    trace!("Prefetching: {}‰", status.fill_level);
                    thread::sleep(poll);
                }
            }
        }

        let duration = decoder.duration_millis().unwrap_or_else(|| {
            warn!("Source duration unknown");
            0
        });
        lock(&self.flags).total_duration_millis = duration;
        info!("Prefetch complete, duration {} ms", duration);

        decoder.play()?;
        self.run_pipeline()
    }

    /// The pipeline loop: opens the output on the first start request and
    /// keeps it fed until the session is finished.
    pub fn run_pipeline(&self) -> Result<()> {
        self.set_state(PipelineState::AwaitingStartSignal);

        let mut output: Option<Box<dyn OutputSink>> = None;
        let result = self.pipeline_loop(&mut output);

        self.set_state(PipelineState::Stopping);
        if let Some(mut output) = output.take() {
            output.clear_completion_callback();
            if let Err(e) = output.stop() {
                warn!("Failed to stop output: {}", e);
            }
        }
        self.pool.release_all();
        self.set_state(PipelineState::Finished);
        result
    }

    fn pipeline_loop(&self, output: &mut Option<Box<dyn OutputSink>>) -> Result<()> {
        let tick = self.params.tick();
        loop {
            if self.take_start_request() && output.is_none() {
                *output = Some(self.open_output()?);
                self.set_state(PipelineState::Streaming);
            }

            if let Some(output) = output.as_mut() {
                self.enqueue_more_audio(output.as_mut());
            }

            if self.is_finished() {
                debug!("Pipeline finished");
                return Ok(());
            }
            thread::sleep(tick);
        }
    }

    fn open_output(&self) -> Result<Box<dyn OutputSink>> {
        let mut output = self
            .outputs
            .create(self.params.sample_rate, self.params.channels)?;
        let pool = Arc::clone(&self.pool);
        output.set_completion_callback(Box::new(move || pool.on_output_consumed()));
        output.start()?;
        info!(
            "Output started ({}Hz, {} channels)",
            self.params.sample_rate, self.params.channels
        );
        Ok(output)
    }

    /// Submits scaled blocks until there is nothing to scale or the output
    /// queue is full.
    fn enqueue_more_audio(&self, output: &mut dyn OutputSink) {
        while !self.is_stop_requested() && self.has_decoded_audio() && !self.pool.has_reached_limit()
        {
            let mut buffer = self.pool.acquire();
            let frames = lock(&self.scaler).fill_buffer(&self.decode, &mut buffer);

            if frames == 0 {
                self.pool.recycle(buffer);
                if self.is_end_of_decode_reached() {
                    let dropped = self.decode.lock().discard_buffered();
                    self.decode.notify_drained();
                    trace!("Discarded {} trailing bytes", dropped);
                }
                break;
            }

            if let Err(e) = self.pool.submit(buffer, |shared| output.enqueue(shared)) {
                warn!("Output did not accept buffer: {}", e);
                break;
            }
        }
    }
}

impl DecodeSink for AudioEngine {
    fn on_decoded(&self, bytes: &[u8]) {
        let tick = self.params.tick();
        let abandon = || self.should_abandon_wait();

        let Some(mut ring) = self.decode.wait_for_room(bytes.len(), tick, abandon) else {
            trace!("Dropping {} decoded bytes after stop", bytes.len());
            return;
        };
        if let Err(e) = ring.add_data(bytes) {
            error!("Dropping decoded audio: {}", e);
        }
        drop(ring);

        // Hold the decoder back while the buffer is full.
        self.decode.wait_while_too_large(tick, abandon);
    }

    fn on_event(&self, event: DecodeEvent) {
        match event {
            DecodeEvent::EndOfStream => debug!("End of stream"),
            DecodeEvent::Error(message) => warn!("Decoding ended with error: {}", message),
        }
        self.mark_end_of_decode();
    }
}
