use audioadapter_buffers::direct::SequentialSliceOfVecs;
use rubato::{Fft, FixedSync, Resampler as RubatoResampler};
use tracing::debug;

use crate::error::{Error, Result};

/// Sample rate converter between the decoded source and the engine rate.
///
/// Accepts and returns interleaved samples; input is buffered until a whole
/// chunk is available.
pub struct Resampler {
    resampler: Fft<f32>,
    channels: usize,
    chunk_size: usize,
    source_rate: u64,
    target_rate: u64,
    buffer: Vec<f32>,
}

impl Resampler {
    pub fn new(
        source_sample_rate: u32,
        target_sample_rate: u32,
        channels: usize,
        chunk_size: usize,
    ) -> Result<Self> {
        let resampler = Fft::<f32>::new(
            source_sample_rate as usize,
            target_sample_rate as usize,
            chunk_size,
            2,
            channels,
            FixedSync::Input,
        )
        .map_err(|e| Error::Resample(e.to_string()))?;

        debug!(
            "Resampler {}Hz -> {}Hz, {} channels, chunk {}",
            source_sample_rate, target_sample_rate, channels, chunk_size
        );

        Ok(Self {
            resampler,
            channels,
            chunk_size,
            source_rate: u64::from(source_sample_rate),
            target_rate: u64::from(target_sample_rate),
            buffer: Vec::with_capacity(chunk_size * channels),
        })
    }

    /// Converts as many whole chunks as `input` completes.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        self.buffer.extend_from_slice(input);

        let chunk_len = self.chunk_size * self.channels;
        let mut all_output = Vec::new();

        while self.buffer.len() >= chunk_len {
            let mut input_buffer = vec![vec![0.0; self.chunk_size]; self.channels];
            for (i, frame) in self.buffer[..chunk_len].chunks_exact(self.channels).enumerate() {
                for (ch, &sample) in frame.iter().enumerate() {
                    input_buffer[ch][i] = sample;
                }
            }
            self.buffer.drain(..chunk_len);

            let out_len = self.resampler.output_frames_next();
            let mut output_buffer = vec![vec![0.0; out_len]; self.channels];

            let input_adapter =
                SequentialSliceOfVecs::new(&input_buffer, self.channels, self.chunk_size)
                    .map_err(|e| Error::Resample(e.to_string()))?;
            let mut output_adapter =
                SequentialSliceOfVecs::new_mut(&mut output_buffer, self.channels, out_len)
                    .map_err(|e| Error::Resample(e.to_string()))?;

            self.resampler
                .process_into_buffer(&input_adapter, &mut output_adapter, None)
                .map_err(|e| Error::Resample(e.to_string()))?;

            all_output.reserve(out_len * self.channels);
            for i in 0..out_len {
                for channel in &output_buffer {
                    all_output.push(channel[i]);
                }
            }
        }

        Ok(all_output)
    }

    /// Converts the pending partial chunk, returning only the output that
    /// corresponds to real input.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        if self.buffer.is_empty() {
            return Ok(Vec::new());
        }

        let remaining_frames = self.buffer.len() / self.channels;
        let padding = (self.chunk_size - remaining_frames) * self.channels;
        self.buffer.resize(self.buffer.len() + padding, 0.0);

        let expected_frames = (remaining_frames as u64 * self.target_rate)
            .div_ceil(self.source_rate) as usize;
        let mut output = self.process(&[])?;
        output.truncate(expected_frames * self.channels);
        Ok(output)
    }
}
