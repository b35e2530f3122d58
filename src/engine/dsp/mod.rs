pub mod resampler;
pub mod sola;

/// Pitch-preserving time scaler consumed by the pipeline.
///
/// Push/pull interface with bounded windows: input is pushed with
/// [`inject`](TimeScaler::inject) as long as [`input_limit`](TimeScaler::input_limit)
/// allows, scaled output is pulled with [`retrieve`](TimeScaler::retrieve).
/// Samples are interleaved `f32` in [-1.0, 1.0]; counts are in frames.
/// A zero return from `inject` or `retrieve` means the call failed.
pub trait TimeScaler: Send {
    /// Sets the speed ratio (2.0 plays twice as fast).
    fn set_speed(&mut self, speed: f32);

    fn speed(&self) -> f32;

    /// Scaled frames ready to retrieve.
    fn available(&self) -> usize;

    /// Frames that can be injected right now.
    fn input_limit(&self) -> usize;

    /// Pushes up to `frames` frames from `input`, returning how many were consumed.
    fn inject(&mut self, input: &[f32], frames: usize) -> usize;

    /// Pulls up to `max_frames` frames into `output`, returning how many were written.
    fn retrieve(&mut self, output: &mut [f32], max_frames: usize) -> usize;
}

/// Builds one scaler per playback session.
pub trait ScalerFactory: Send + Sync {
    fn create(&self, params: &crate::config::EngineParameters) -> Box<dyn TimeScaler>;
}
