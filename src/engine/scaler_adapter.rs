//! Fills one output block from the decode buffer through the time scaler.

use crate::engine::buffer::pool::PlayBuffer;
use crate::engine::buffer::SharedDecodeBuffer;
use crate::engine::dsp::TimeScaler;
use tracing::{trace, warn};

/// Drives a [`TimeScaler`] one output block at a time.
///
/// Each fill alternates between draining scaled output and feeding the
/// scaler fresh input from the decode buffer, and never blocks. A fill that
/// produces zero frames means nothing can be played right now.
pub struct ScalerAdapter {
    scaler: Box<dyn TimeScaler>,
    channels: usize,
    target_frames: usize,
    /// Scaled output of the current block.
    float_buffer: Vec<f32>,
    /// Input staged from the decode buffer before injection.
    inject_buffer: Vec<f32>,
}

impl ScalerAdapter {
    pub fn new(scaler: Box<dyn TimeScaler>, channels: usize, target_frames: usize) -> Self {
        let channels = channels.max(1);
        Self {
            scaler,
            channels,
            target_frames,
            float_buffer: vec![0.0; target_frames * channels],
            inject_buffer: vec![0.0; target_frames * channels],
        }
    }

    pub fn set_speed(&mut self, speed: f32) {
        self.scaler.set_speed(speed);
    }

    pub fn speed(&self) -> f32 {
        self.scaler.speed()
    }

    pub fn target_frames(&self) -> usize {
        self.target_frames
    }

    /// The block produced by the last [`fill`](Self::fill), `frames` long.
    pub fn block(&self, frames: usize) -> &[f32] {
        &self.float_buffer[..frames * self.channels]
    }

    /// Produces up to `target_frames` scaled frames and returns how many.
    pub fn fill(&mut self, decode: &SharedDecodeBuffer) -> usize {
        let ch = self.channels;
        let target = self.target_frames;
        let mut produced = 0;

        while produced < target {
            let available = self.scaler.available();
            if available > 0 {
                let wanted = available.min(target - produced);
                let retrieved = self
                    .scaler
                    .retrieve(&mut self.float_buffer[produced * ch..], wanted);
                if retrieved == 0 {
                    warn!("Scaler reported {} frames available but retrieved none", available);
                    break;
                }
                produced += retrieved.min(wanted);
                continue;
            }

            let offered = {
                let ring = decode.lock();
                let frames = (ring.sample_count() / ch)
                    .min(target)
                    .min(self.scaler.input_limit());
                for (i, slot) in self.inject_buffer[..frames * ch].iter_mut().enumerate() {
                    *slot = ring.get_at_index(i).map_or(0.0, |s| s as f32 / 32768.0);
                }
                frames
            };
            if offered == 0 {
                break;
            }

            let consumed = self
                .scaler
                .inject(&self.inject_buffer[..offered * ch], offered)
                .min(offered);
            if consumed == 0 {
                warn!("Scaler refused {} frames of input", offered);
                break;
            }
            decode.lock().advance_head_pointer_shorts(consumed * ch);
            decode.notify_drained();
        }

        trace!("Filled {} of {} frames", produced, target);
        produced
    }

    /// Fills `buffer` with one scaled block and returns its frame count.
    pub fn fill_buffer(&mut self, decode: &SharedDecodeBuffer, buffer: &mut PlayBuffer) -> usize {
        let frames = self.fill(decode);
        buffer.write_from_f32(self.block(frames), frames);
        frames
    }
}
