//! Test doubles for the decoder, output and scaler seams.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use varispeed::config::EngineParameters;
use varispeed::engine::buffer::pool::SharedPlayBuffer;
use varispeed::engine::decoder::{
    DecodeEvent, DecodeSink, DecoderFactory, DecoderService, PrefetchState, PrefetchStatus,
};
use varispeed::engine::dsp::{ScalerFactory, TimeScaler};
use varispeed::engine::output::{CompletionCallback, OutputFactory, OutputSink};
use varispeed::{Error, Result};

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Little-endian PCM of `samples` 16-bit samples forming a ramp.
pub fn pcm_bytes(samples: usize) -> Vec<u8> {
    (0..samples)
        .flat_map(|i| ((i % 2000) as i16 - 1000).to_le_bytes())
        .collect()
}

// ---------------------------------------------------------------------------
// Scaler

/// Speed-agnostic scaler that passes frames through unchanged.
pub struct PassthroughScaler {
    channels: usize,
    limit: usize,
    speed: f32,
    queue: VecDeque<f32>,
}

impl PassthroughScaler {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            limit: 4096,
            speed: 1.0,
            queue: VecDeque::new(),
        }
    }
}

impl TimeScaler for PassthroughScaler {
    fn set_speed(&mut self, speed: f32) {
        self.speed = speed;
    }

    fn speed(&self) -> f32 {
        self.speed
    }

    fn available(&self) -> usize {
        self.queue.len() / self.channels
    }

    fn input_limit(&self) -> usize {
        self.limit.saturating_sub(self.available())
    }

    fn inject(&mut self, input: &[f32], frames: usize) -> usize {
        let frames = frames.min(self.input_limit());
        self.queue.extend(&input[..frames * self.channels]);
        frames
    }

    fn retrieve(&mut self, output: &mut [f32], max_frames: usize) -> usize {
        let frames = self.available().min(max_frames);
        for (out, sample) in output
            .iter_mut()
            .zip(self.queue.drain(..frames * self.channels))
        {
            *out = sample;
        }
        frames
    }
}

pub struct PassthroughScalerFactory;

impl ScalerFactory for PassthroughScalerFactory {
    fn create(&self, params: &EngineParameters) -> Box<dyn TimeScaler> {
        let mut scaler = PassthroughScaler::new(params.channels);
        scaler.set_speed(params.initial_rate);
        Box::new(scaler)
    }
}

// ---------------------------------------------------------------------------
// Output

#[derive(Default)]
pub struct OutputLog {
    pub created: usize,
    pub started: usize,
    pub stopped: usize,
    /// Frame counts of accepted buffers, in submission order.
    pub accepted: Vec<usize>,
    pub rejected: usize,
    /// Enqueues still to reject.
    pub reject_next: usize,
    /// Buffers handed over and not yet completed.
    queue: VecDeque<SharedPlayBuffer>,
    callback: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// Output double. Completes buffers either as soon as they are queued or
/// only when the test calls [`complete_one`](Self::complete_one).
#[derive(Clone)]
pub struct MockOutputFactory {
    log: Arc<Mutex<OutputLog>>,
    auto_complete: bool,
}

impl MockOutputFactory {
    pub fn manual() -> Self {
        Self {
            log: Arc::new(Mutex::new(OutputLog::default())),
            auto_complete: false,
        }
    }

    pub fn auto() -> Self {
        Self {
            auto_complete: true,
            ..Self::manual()
        }
    }

    pub fn log(&self) -> std::sync::MutexGuard<'_, OutputLog> {
        self.log.lock().unwrap()
    }

    pub fn accepted(&self) -> Vec<usize> {
        self.log().accepted.clone()
    }

    pub fn queued(&self) -> usize {
        self.log().queue.len()
    }

    pub fn reject_next(&self, count: usize) {
        self.log().reject_next = count;
    }

    /// Finishes the oldest queued buffer. Returns false if none was queued.
    pub fn complete_one(&self) -> bool {
        complete_front(&self.log)
    }
}

fn complete_front(log: &Mutex<OutputLog>) -> bool {
    let callback = {
        let mut log = log.lock().unwrap();
        if log.queue.pop_front().is_none() {
            return false;
        }
        log.callback.clone()
    };
    if let Some(callback) = callback {
        callback();
    }
    true
}

impl OutputFactory for MockOutputFactory {
    fn create(&self, _sample_rate: u32, _channels: usize) -> Result<Box<dyn OutputSink>> {
        self.log().created += 1;
        Ok(Box::new(MockOutput {
            log: self.log.clone(),
            auto_complete: self.auto_complete,
        }))
    }
}

struct MockOutput {
    log: Arc<Mutex<OutputLog>>,
    auto_complete: bool,
}

impl OutputSink for MockOutput {
    fn set_completion_callback(&mut self, callback: CompletionCallback) {
        self.log.lock().unwrap().callback = Some(Arc::from(callback));
    }

    fn clear_completion_callback(&mut self) {
        self.log.lock().unwrap().callback = None;
    }

    fn start(&mut self) -> Result<()> {
        self.log.lock().unwrap().started += 1;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.stopped += 1;
        log.queue.clear();
        Ok(())
    }

    fn enqueue(&mut self, buffer: SharedPlayBuffer) -> Result<()> {
        {
            let mut log = self.log.lock().unwrap();
            if log.reject_next > 0 {
                log.reject_next -= 1;
                log.rejected += 1;
                return Err(Error::AudioOutput("mock output is full".into()));
            }
            log.accepted.push(buffer.frames());
            log.queue.push_back(buffer);
        }
        if self.auto_complete {
            complete_front(&self.log);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Decoder

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderCall {
    SetSink,
    ClearSink,
    Play,
    Pause,
    Stop,
    Seek(u64),
}

/// Decoder double that plays back a fixed byte stream in chunks.
#[derive(Clone)]
pub struct MockDecoderFactory {
    pub data: Arc<Vec<u8>>,
    pub chunk: usize,
    pub duration_millis: Option<u64>,
    pub prefetch: PrefetchState,
    pub calls: Arc<Mutex<Vec<DecoderCall>>>,
    pub opened: Arc<Mutex<usize>>,
}

impl MockDecoderFactory {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            chunk: 2304,
            duration_millis: Some(1000),
            prefetch: PrefetchState::SufficientData,
            calls: Arc::new(Mutex::new(Vec::new())),
            opened: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_prefetch(mut self, prefetch: PrefetchState) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_duration(mut self, duration_millis: Option<u64>) -> Self {
        self.duration_millis = duration_millis;
        self
    }

    pub fn decoder(&self) -> MockDecoder {
        MockDecoder {
            factory: self.clone(),
            sink: Arc::new(Mutex::new(None)),
            worker: None,
        }
    }

    pub fn calls(&self) -> Vec<DecoderCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn opened(&self) -> usize {
        *self.opened.lock().unwrap()
    }
}

impl DecoderFactory for MockDecoderFactory {
    fn open(&self, _source: &Path, _params: &EngineParameters) -> Result<Box<dyn DecoderService>> {
        *self.opened.lock().unwrap() += 1;
        Ok(Box::new(self.decoder()))
    }
}

pub struct MockDecoder {
    factory: MockDecoderFactory,
    sink: Arc<Mutex<Option<Arc<dyn DecodeSink>>>>,
    worker: Option<JoinHandle<()>>,
}

impl MockDecoder {
    fn record(&self, call: DecoderCall) {
        self.factory.calls.lock().unwrap().push(call);
    }
}

impl DecoderService for MockDecoder {
    fn set_sink(&mut self, sink: Arc<dyn DecodeSink>) {
        self.record(DecoderCall::SetSink);
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn clear_sink(&mut self) {
        self.record(DecoderCall::ClearSink);
        *self.sink.lock().unwrap() = None;
    }

    fn play(&mut self) -> Result<()> {
        self.record(DecoderCall::Play);
        if self.worker.is_some() {
            return Ok(());
        }
        let data = self.factory.data.clone();
        let chunk = self.factory.chunk;
        let sink = self.sink.clone();
        let failed = self.factory.prefetch == PrefetchState::Error;
        self.worker = Some(thread::spawn(move || {
            for piece in data.chunks(chunk) {
                let current = sink.lock().unwrap().clone();
                match current {
                    Some(sink) => sink.on_decoded(piece),
                    None => return,
                }
            }
            let current = sink.lock().unwrap().clone();
            if let Some(sink) = current {
                if failed {
                    sink.on_event(DecodeEvent::Error("mock failure".into()));
                } else {
                    sink.on_event(DecodeEvent::EndOfStream);
                }
            }
        }));
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.record(DecoderCall::Pause);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.record(DecoderCall::Stop);
        if let Some(worker) = self.worker.take() {
            worker.join().unwrap();
        }
        Ok(())
    }

    fn seek(&mut self, position_millis: u64) -> Result<()> {
        self.record(DecoderCall::Seek(position_millis));
        Ok(())
    }

    fn duration_millis(&self) -> Option<u64> {
        self.factory.duration_millis
    }

    fn prefetch_status(&self) -> PrefetchStatus {
        let level = match self.factory.prefetch {
            PrefetchState::Underflow => 250,
            _ => 1000,
        };
        PrefetchStatus::new(level, self.factory.prefetch)
    }
}
