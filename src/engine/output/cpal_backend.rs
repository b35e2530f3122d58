use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, FromSample, Sample, SampleFormat, Stream, StreamConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

use crate::engine::buffer::pool::SharedPlayBuffer;
use crate::engine::lock;
use crate::engine::output::{CompletionCallback, OutputFactory, OutputSink};
use crate::error::{Error, Result};

/// Buffers waiting to be played, front first.
#[derive(Default)]
struct PlaybackQueue {
    buffers: VecDeque<SharedPlayBuffer>,
    /// Samples of the front buffer already written to the device.
    cursor: usize,
    on_complete: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl PlaybackQueue {
    /// Copies queued samples into `data`, padding with silence.
    /// Returns how many buffers were finished.
    fn render<T: Sample + FromSample<i16>>(&mut self, data: &mut [T]) -> usize {
        let mut written = 0;
        let mut completed = 0;

        while written < data.len() {
            let Some(front) = self.buffers.front() else {
                break;
            };
            let samples = front.samples();
            let n = (samples.len() - self.cursor).min(data.len() - written);
            for (out, &sample) in data[written..written + n]
                .iter_mut()
                .zip(&samples[self.cursor..self.cursor + n])
            {
                *out = T::from_sample(sample);
            }
            written += n;
            self.cursor += n;

            if self.cursor >= samples.len() {
                self.buffers.pop_front();
                self.cursor = 0;
                completed += 1;
            }
        }

        for sample in &mut data[written..] {
            *sample = T::EQUILIBRIUM;
        }
        completed
    }
}

/// Default-device output through cpal.
pub struct CpalOutput {
    stream: Stream,
    queue: Arc<Mutex<PlaybackQueue>>,
    is_healthy: Arc<AtomicBool>,
}

impl CpalOutput {
    pub fn new(sample_rate: u32, channels: usize) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::AudioOutput("no output device available".into()))?;

        let device_id = device.name().unwrap_or_else(|_| "unknown".to_string());
        let sample_format = device
            .default_output_config()
            .map_err(|e| Error::AudioOutput(e.to_string()))?
            .sample_format();

        let config = StreamConfig {
            channels: channels as u16,
            sample_rate,
            buffer_size: BufferSize::Default,
        };

        let is_healthy = Arc::new(AtomicBool::new(true));
        let is_healthy_err = is_healthy.clone();
        let err_fn = move |err: cpal::StreamError| {
            error!("Output stream error: {}", err);
            is_healthy_err.store(false, Ordering::SeqCst);
        };

        let queue = Arc::new(Mutex::new(PlaybackQueue::default()));
        let queue_for_callback = queue.clone();

        let stream = match sample_format {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _| process_audio(data, &queue_for_callback),
                err_fn,
                None,
            ),
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _| process_audio(data, &queue_for_callback),
                err_fn,
                None,
            ),
            SampleFormat::U16 => device.build_output_stream(
                &config,
                move |data: &mut [u16], _| process_audio(data, &queue_for_callback),
                err_fn,
                None,
            ),
            other => {
                return Err(Error::AudioOutput(format!(
                    "unsupported sample format {:?}",
                    other
                )))
            }
        }
        .map_err(|e| Error::AudioOutput(e.to_string()))?;

        info!(
            "Output on {} ({}Hz, {} channels, {:?})",
            device_id, sample_rate, channels, sample_format
        );

        Ok(Self {
            stream,
            queue,
            is_healthy,
        })
    }
}

impl OutputSink for CpalOutput {
    fn set_completion_callback(&mut self, callback: CompletionCallback) {
        lock(&self.queue).on_complete = Some(Arc::from(callback));
    }

    fn clear_completion_callback(&mut self) {
        lock(&self.queue).on_complete = None;
    }

    fn start(&mut self) -> Result<()> {
        self.stream
            .play()
            .map_err(|e| Error::AudioOutput(e.to_string()))
    }

    fn pause(&mut self) -> Result<()> {
        self.stream
            .pause()
            .map_err(|e| Error::AudioOutput(e.to_string()))
    }

    fn stop(&mut self) -> Result<()> {
        let _ = self.stream.pause();
        let mut queue = lock(&self.queue);
        debug!("Output stopped with {} buffers queued", queue.buffers.len());
        queue.buffers.clear();
        queue.cursor = 0;
        Ok(())
    }

    fn enqueue(&mut self, buffer: SharedPlayBuffer) -> Result<()> {
        if !self.is_healthy.load(Ordering::SeqCst) {
            return Err(Error::AudioOutput("output stream has failed".into()));
        }
        lock(&self.queue).buffers.push_back(buffer);
        Ok(())
    }
}

/// Opens [`CpalOutput`]s on the default device.
pub struct CpalOutputFactory;

impl OutputFactory for CpalOutputFactory {
    fn create(&self, sample_rate: u32, channels: usize) -> Result<Box<dyn OutputSink>> {
        Ok(Box::new(CpalOutput::new(sample_rate, channels)?))
    }
}

fn process_audio<T: Sample + FromSample<i16>>(data: &mut [T], queue: &Mutex<PlaybackQueue>) {
    let (completed, on_complete) = {
        let mut queue = lock(queue);
        let completed = queue.render(data);
        (completed, queue.on_complete.clone())
    };

    // Completions run without the queue lock; the callback may enqueue.
    if let Some(on_complete) = on_complete {
        for _ in 0..completed {
            on_complete();
        }
    }
}
