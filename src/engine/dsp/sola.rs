use std::collections::VecDeque;

use crate::config::EngineParameters;
use crate::engine::dsp::{ScalerFactory, TimeScaler};

/// Synchronized overlap-add time scaler.
///
/// Input is cut into windows taken every `analysis_hop` frames and laid down
/// every `synthesis_hop` frames, each window crossfaded into the tail of the
/// previous one over `overlap` frames. Before each crossfade the window start
/// is shifted by up to `search` frames to the position best correlated with
/// that tail, which keeps periodic material in phase.
pub struct SolaScaler {
    channels: usize,
    window: usize,
    overlap: usize,
    search: usize,
    speed: f32,
    input: Vec<f32>,
    output: VecDeque<f32>,
    tail: Vec<f32>,
    has_tail: bool,
}

impl SolaScaler {
    pub fn new(
        sample_rate: u32,
        channels: usize,
        speed: f32,
        window_duration: f32,
        overlap_duration: f32,
    ) -> Self {
        let channels = channels.max(1);
        let window = ((window_duration * sample_rate as f32).round() as usize).max(2);
        let overlap = ((overlap_duration * sample_rate as f32).round() as usize).clamp(1, window / 2);

        let mut scaler = Self {
            channels,
            window,
            overlap,
            search: overlap,
            speed: 1.0,
            input: Vec::new(),
            output: VecDeque::new(),
            tail: vec![0.0; overlap * channels],
            has_tail: false,
        };
        scaler.set_speed(speed);
        scaler
    }

    pub fn from_params(params: &EngineParameters) -> Self {
        Self::new(
            params.sample_rate,
            params.channels,
            params.initial_rate,
            params.window_duration,
            params.window_overlap_duration,
        )
    }

    fn synthesis_hop(&self) -> usize {
        self.window - self.overlap
    }

    fn analysis_hop(&self) -> usize {
        ((self.synthesis_hop() as f32 * self.speed).round() as usize).max(1)
    }

    /// Frames that must be buffered before one window can be processed.
    fn frames_needed(&self) -> usize {
        (self.window + self.search).max(self.analysis_hop())
    }

    fn input_capacity(&self) -> usize {
        2 * self.frames_needed()
    }

    fn buffered_frames(&self) -> usize {
        self.input.len() / self.channels
    }

    /// Offset within `0..=search` whose first `overlap` frames best match the tail.
    fn best_offset(&self) -> usize {
        let ch = self.channels;
        let span = self.overlap * ch;
        let mut best = 0;
        let mut best_score = f32::NEG_INFINITY;

        for offset in 0..=self.search {
            let candidate = &self.input[offset * ch..offset * ch + span];
            let (mut corr, mut energy) = (0.0f32, 0.0f32);
            for (t, c) in self.tail.iter().zip(candidate) {
                corr += t * c;
                energy += c * c;
            }
            let score = corr / (energy + 1e-9).sqrt();
            if score > best_score {
                best_score = score;
                best = offset;
            }
        }
        best
    }

    fn process_window(&mut self) {
        let ch = self.channels;
        let offset = if self.has_tail { self.best_offset() } else { 0 };
        let start = offset * ch;
        let hop = self.synthesis_hop();

        let segment = &self.input[start..start + self.window * ch];
        if self.has_tail {
            for frame in 0..self.overlap {
                let fade_in = (frame + 1) as f32 / (self.overlap + 1) as f32;
                for c in 0..ch {
                    let i = frame * ch + c;
                    self.output
                        .push_back(self.tail[i] * (1.0 - fade_in) + segment[i] * fade_in);
                }
            }
        } else {
            self.output.extend(&segment[..self.overlap * ch]);
        }
        self.output.extend(&segment[self.overlap * ch..hop * ch]);
        self.tail.copy_from_slice(&segment[hop * ch..self.window * ch]);
        self.has_tail = true;

        let advance = self.analysis_hop() * ch;
        self.input.drain(..advance.min(self.input.len()));
    }

    fn process_ready_windows(&mut self) {
        while self.buffered_frames() >= self.frames_needed() {
            self.process_window();
        }
    }
}

impl TimeScaler for SolaScaler {
    fn set_speed(&mut self, speed: f32) {
        if speed.is_finite() && speed > 0.0 {
            self.speed = speed;
            // Queued input may already fill a window at the new speed.
            self.process_ready_windows();
        }
    }

    fn speed(&self) -> f32 {
        self.speed
    }

    fn available(&self) -> usize {
        self.output.len() / self.channels
    }

    fn input_limit(&self) -> usize {
        self.input_capacity().saturating_sub(self.buffered_frames())
    }

    fn inject(&mut self, input: &[f32], frames: usize) -> usize {
        let frames = frames
            .min(self.input_limit())
            .min(input.len() / self.channels);
        if frames == 0 {
            return 0;
        }
        self.input.extend_from_slice(&input[..frames * self.channels]);
        self.process_ready_windows();
        frames
    }

    fn retrieve(&mut self, output: &mut [f32], max_frames: usize) -> usize {
        let frames = self
            .available()
            .min(max_frames)
            .min(output.len() / self.channels);
        for (out, sample) in output[..frames * self.channels]
            .iter_mut()
            .zip(self.output.drain(..frames * self.channels))
        {
            *out = sample;
        }
        frames
    }
}

/// Creates a [`SolaScaler`] from the session parameters.
pub struct SolaScalerFactory;

impl ScalerFactory for SolaScalerFactory {
    fn create(&self, params: &EngineParameters) -> Box<dyn TimeScaler> {
        Box::new(SolaScaler::from_params(params))
    }
}
