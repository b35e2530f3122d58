use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision};
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use tracing::{debug, error, trace, warn};

use crate::config::EngineParameters;
use crate::engine::decoder::{
    DecodeEvent, DecodeSink, DecoderFactory, DecoderService, PrefetchState, PrefetchStatus,
    CHUNK_BYTES, PREFETCH_CHUNKS,
};
use crate::engine::dsp::resampler::Resampler;
use crate::engine::lock;
use crate::error::{Error, Result};

const RESAMPLER_CHUNK_FRAMES: usize = 1024;
const IDLE_WAIT: Duration = Duration::from_millis(5);

const STATUS_UNDERFLOW: u8 = 0;
const STATUS_SUFFICIENT: u8 = 1;
const STATUS_ERROR: u8 = 2;

enum DecoderCommand {
    Play,
    Pause,
    Seek(u64),
    Stop,
}

/// State shared between the handle and the worker thread.
struct Shared {
    sink: Mutex<Option<Arc<dyn DecodeSink>>>,
    fill_level: AtomicU32,
    status: AtomicU8,
    /// Seeks sent to the worker and not yet handled. Status published
    /// before the worker gets to them describes the old position.
    pending_seeks: AtomicUsize,
}

impl Shared {
    fn new() -> Self {
        Self {
            sink: Mutex::new(None),
            fill_level: AtomicU32::new(0),
            status: AtomicU8::new(STATUS_UNDERFLOW),
            pending_seeks: AtomicUsize::new(0),
        }
    }

    fn publish(&self, staged: usize, status: u8) {
        let level = (staged * 1000 / PREFETCH_CHUNKS).min(1000) as u32;
        self.fill_level.store(level, Ordering::Relaxed);
        self.status.store(status, Ordering::Release);
    }

    fn prefetch_status(&self) -> PrefetchStatus {
        if self.pending_seeks.load(Ordering::Acquire) > 0 {
            return PrefetchStatus::new(0, PrefetchState::Underflow);
        }
        let state = match self.status.load(Ordering::Acquire) {
            STATUS_SUFFICIENT => PrefetchState::SufficientData,
            STATUS_ERROR => PrefetchState::Error,
            _ => PrefetchState::Underflow,
        };
        PrefetchStatus::new(self.fill_level.load(Ordering::Relaxed), state)
    }
}

/// File decoder backed by Symphonia, running on its own thread.
///
/// Output is converted to the engine's channel count and sample rate and
/// delivered as 16-bit little-endian PCM in [`CHUNK_BYTES`] chunks.
pub struct SymphoniaDecoder {
    command_tx: Sender<DecoderCommand>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    duration_millis: Option<u64>,
}

impl SymphoniaDecoder {
    pub fn open<P: AsRef<Path>>(path: P, params: &EngineParameters) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path_ref.extension().and_then(|s| s.to_str()) {
            hint.with_extension(ext);
        }

        let mut probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| Error::Decode(format!("{}: {}", path_ref.display(), e)))?;

        if let Some(revision) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
            log_tags(revision);
        }
        let mut reader = probed.format;
        if let Some(revision) = reader.metadata().current() {
            log_tags(revision);
        }

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::Decode("no supported audio track".into()))?;

        let track_id = track.id;
        let source_rate = track.codec_params.sample_rate.unwrap_or(params.sample_rate);
        let duration_millis = track
            .codec_params
            .n_frames
            .map(|frames| frames * 1000 / u64::from(source_rate.max(1)));

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(e.to_string()))?;

        debug!(
            "Opened {} ({}Hz, {:?} ms)",
            path_ref.display(),
            source_rate,
            duration_millis
        );

        let shared = Arc::new(Shared::new());
        let (command_tx, command_rx) = mpsc::channel();

        let worker = DecodeWorker {
            reader,
            decoder,
            track_id,
            source_rate,
            target_rate: params.sample_rate,
            target_channels: params.channels,
            resampler: None,
            skip_frames: 0,
            pending: Vec::with_capacity(CHUNK_BYTES * 2),
            staged: VecDeque::with_capacity(PREFETCH_CHUNKS),
            end: None,
            end_reported: false,
            playing: false,
            shared: Arc::clone(&shared),
            rx: command_rx,
        };
        let handle = thread::Builder::new()
            .name("varispeed-decoder".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            command_tx,
            shared,
            worker: Some(handle),
            duration_millis,
        })
    }

    fn send(&self, command: DecoderCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| Error::Decode("decoder thread has exited".into()))
    }
}

impl DecoderService for SymphoniaDecoder {
    fn set_sink(&mut self, sink: Arc<dyn DecodeSink>) {
        *lock(&self.shared.sink) = Some(sink);
    }

    fn clear_sink(&mut self) {
        *lock(&self.shared.sink) = None;
    }

    fn play(&mut self) -> Result<()> {
        self.send(DecoderCommand::Play)
    }

    fn pause(&mut self) -> Result<()> {
        self.send(DecoderCommand::Pause)
    }

    fn stop(&mut self) -> Result<()> {
        // The worker may already be gone after a fatal error.
        let _ = self.command_tx.send(DecoderCommand::Stop);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("Decoder thread panicked");
            }
        }
        Ok(())
    }

    fn seek(&mut self, position_millis: u64) -> Result<()> {
        self.shared.pending_seeks.fetch_add(1, Ordering::AcqRel);
        let sent = self.send(DecoderCommand::Seek(position_millis));
        if sent.is_err() {
            self.shared.pending_seeks.fetch_sub(1, Ordering::AcqRel);
        }
        sent
    }

    fn duration_millis(&self) -> Option<u64> {
        self.duration_millis
    }

    fn prefetch_status(&self) -> PrefetchStatus {
        self.shared.prefetch_status()
    }
}

impl Drop for SymphoniaDecoder {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Opens [`SymphoniaDecoder`]s.
pub struct SymphoniaDecoderFactory;

impl DecoderFactory for SymphoniaDecoderFactory {
    fn open(&self, source: &Path, params: &EngineParameters) -> Result<Box<dyn DecoderService>> {
        Ok(Box::new(SymphoniaDecoder::open(source, params)?))
    }
}

fn log_tags(revision: &MetadataRevision) {
    for tag in revision.tags() {
        debug!("Tag {} = {}", tag.key, tag.value);
    }
}

/// Why the worker stopped producing.
enum StreamEnd {
    Exhausted,
    Failed(String),
}

enum Produced {
    Chunk(Vec<u8>),
    Ended,
}

struct DecodeWorker {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    source_rate: u32,
    target_rate: u32,
    target_channels: usize,
    resampler: Option<Resampler>,
    /// Source frames still to drop after landing short of a seek target.
    skip_frames: u64,
    /// Converted bytes not yet making up a whole chunk.
    pending: Vec<u8>,
    /// Chunks decoded while paused.
    staged: VecDeque<Vec<u8>>,
    end: Option<StreamEnd>,
    end_reported: bool,
    playing: bool,
    shared: Arc<Shared>,
    rx: Receiver<DecoderCommand>,
}

impl DecodeWorker {
    fn run(mut self) {
        loop {
            // Drain commands
            loop {
                match self.rx.try_recv() {
                    Ok(DecoderCommand::Stop) | Err(TryRecvError::Disconnected) => {
                        trace!("Decoder thread exiting");
                        return;
                    }
                    Ok(command) => self.handle(command),
                    Err(TryRecvError::Empty) => break,
                }
            }

            if self.playing {
                self.deliver_next();
            } else if self.staged.len() < PREFETCH_CHUNKS && self.end.is_none() {
                if let Produced::Chunk(chunk) = self.produce_chunk() {
                    self.staged.push_back(chunk);
                }
                self.publish_prefetch();
            } else {
                match self.rx.recv_timeout(IDLE_WAIT) {
                    Ok(DecoderCommand::Stop) | Err(RecvTimeoutError::Disconnected) => return,
                    Ok(command) => self.handle(command),
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        }
    }

    fn handle(&mut self, command: DecoderCommand) {
        match command {
            DecoderCommand::Play => self.playing = true,
            DecoderCommand::Pause => {
                self.playing = false;
                self.publish_prefetch();
            }
            DecoderCommand::Seek(millis) => self.seek(millis),
            DecoderCommand::Stop => {}
        }
    }

    fn seek(&mut self, millis: u64) {
        let result = self.reader.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time: Time::from(millis as f64 / 1000.0),
                track_id: Some(self.track_id),
            },
        );
        self.skip_frames = match result {
            Ok(seeked) => seeked.required_ts.saturating_sub(seeked.actual_ts),
            Err(e) => {
                warn!("Seek to {} ms failed: {}", millis, e);
                0
            }
        };
        self.decoder.reset();
        self.resampler = None;
        self.pending.clear();
        self.staged.clear();
        self.end = None;
        self.end_reported = false;
        self.publish_prefetch();
        self.shared.pending_seeks.fetch_sub(1, Ordering::AcqRel);
    }

    fn publish_prefetch(&self) {
        let status = match &self.end {
            Some(StreamEnd::Failed(_)) => STATUS_ERROR,
            Some(StreamEnd::Exhausted) => STATUS_SUFFICIENT,
            None if self.staged.len() >= PREFETCH_CHUNKS => STATUS_SUFFICIENT,
            None => STATUS_UNDERFLOW,
        };
        self.shared.publish(self.staged.len(), status);
    }

    fn deliver_next(&mut self) {
        let chunk = match self.staged.pop_front() {
            Some(chunk) => chunk,
            None => match self.produce_chunk() {
                Produced::Chunk(chunk) => chunk,
                Produced::Ended => {
                    self.report_end();
                    // Nothing left; wait for a seek or stop.
                    self.playing = false;
                    return;
                }
            },
        };

        let sink = lock(&self.shared.sink).clone();
        match sink {
            Some(sink) => sink.on_decoded(&chunk),
            None => trace!("No sink attached; dropping {} bytes", chunk.len()),
        }
    }

    fn report_end(&mut self) {
        if self.end_reported {
            return;
        }
        self.end_reported = true;
        let event = match &self.end {
            Some(StreamEnd::Failed(message)) => DecodeEvent::Error(message.clone()),
            _ => DecodeEvent::EndOfStream,
        };
        debug!("Decoder finished: {:?}", event);
        let sink = lock(&self.shared.sink).clone();
        if let Some(sink) = sink {
            sink.on_event(event);
        }
    }

    /// Decodes until one whole chunk is available or the stream ends.
    ///
    /// A short final chunk carries whatever remained at the end.
    fn produce_chunk(&mut self) -> Produced {
        while self.pending.len() < CHUNK_BYTES && self.end.is_none() {
            match self.decode_packet() {
                Ok(Some(samples)) => {
                    if let Err(e) = self.convert(&samples) {
                        error!("Resampling failed: {}", e);
                        self.end = Some(StreamEnd::Failed(e.to_string()));
                    }
                }
                Ok(None) => {
                    self.flush_resampler();
                    self.end = Some(StreamEnd::Exhausted);
                }
                Err(message) => {
                    error!("Decoding failed: {}", message);
                    self.end = Some(StreamEnd::Failed(message));
                }
            }
        }

        if self.pending.is_empty() {
            return Produced::Ended;
        }
        let take = self.pending.len().min(CHUNK_BYTES);
        let rest = self.pending.split_off(take);
        Produced::Chunk(std::mem::replace(&mut self.pending, rest))
    }

    /// Next packet of interleaved samples remixed to the engine channel count.
    /// `Ok(None)` marks the end of the stream.
    fn decode_packet(&mut self) -> std::result::Result<Option<Vec<f32>>, String> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None)
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(err) => return Err(err.to_string()),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(audio_buf) => {
                    let spec = *audio_buf.spec();
                    let source_channels = spec.channels.count().max(1);
                    let mut sample_buf =
                        SampleBuffer::<f32>::new(audio_buf.capacity() as u64, spec);
                    sample_buf.copy_interleaved_ref(audio_buf);
                    let mut samples = sample_buf.samples();
                    if self.skip_frames > 0 {
                        let frames = (samples.len() / source_channels) as u64;
                        let skipped = self.skip_frames.min(frames);
                        self.skip_frames -= skipped;
                        samples = &samples[skipped as usize * source_channels..];
                    }
                    if spec.rate != self.source_rate {
                        debug!("Source rate changed {} -> {}", self.source_rate, spec.rate);
                        self.source_rate = spec.rate;
                        self.resampler = None;
                    }
                    return Ok(Some(remix(
                        samples,
                        source_channels,
                        self.target_channels,
                    )));
                }
                Err(SymphoniaError::DecodeError(err)) => {
                    warn!("Skipping undecodable packet: {}", err);
                    continue;
                }
                Err(err) => return Err(err.to_string()),
            }
        }
    }

    fn convert(&mut self, samples: &[f32]) -> Result<()> {
        if self.source_rate == self.target_rate {
            push_pcm(&mut self.pending, samples);
            return Ok(());
        }
        if self.resampler.is_none() {
            self.resampler = Some(Resampler::new(
                self.source_rate,
                self.target_rate,
                self.target_channels,
                RESAMPLER_CHUNK_FRAMES,
            )?);
        }
        if let Some(resampler) = self.resampler.as_mut() {
            let converted = resampler.process(samples)?;
            push_pcm(&mut self.pending, &converted);
        }
        Ok(())
    }

    fn flush_resampler(&mut self) {
        if let Some(resampler) = self.resampler.as_mut() {
            match resampler.flush() {
                Ok(flushed) => push_pcm(&mut self.pending, &flushed),
                Err(e) => warn!("Resampler flush failed: {}", e),
            }
        }
    }
}

/// Maps interleaved samples from `from` channels to `to` channels.
///
/// Down to mono averages; otherwise channels are copied, repeating the last
/// source channel when widening.
fn remix(samples: &[f32], from: usize, to: usize) -> Vec<f32> {
    if from == to {
        return samples.to_vec();
    }
    let mut out = Vec::with_capacity(samples.len() / from * to);
    for frame in samples.chunks_exact(from) {
        if to == 1 {
            out.push(frame.iter().sum::<f32>() / from as f32);
        } else {
            for c in 0..to {
                out.push(frame[c.min(from - 1)]);
            }
        }
    }
    out
}

fn push_pcm(out: &mut Vec<u8>, samples: &[f32]) {
    out.reserve(samples.len() * 2);
    for &s in samples {
        let value = (s * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
}
