//! Session ownership and the caller-facing player.
//!
//! [`EngineSlot`] holds the single active [`AudioEngine`]; there is no global
//! instance. [`VariableSpeedPlayer`] wraps the slot with a media-player style
//! lifecycle: set a source, prepare, start, pause, seek, release.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::config::EngineParameters;
use crate::engine::decoder::symphonia_decoder::SymphoniaDecoderFactory;
use crate::engine::decoder::DecoderFactory;
use crate::engine::dsp::sola::SolaScalerFactory;
use crate::engine::dsp::ScalerFactory;
use crate::engine::engine::AudioEngine;
use crate::engine::lock;
use crate::engine::output::cpal_backend::CpalOutputFactory;
use crate::engine::output::OutputFactory;
use crate::error::{Error, Result};

/// Holds at most one engine at a time.
#[derive(Default)]
pub struct EngineSlot {
    engine: Mutex<Option<Arc<AudioEngine>>>,
}

impl EngineSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `engine`; fails if another engine is already active.
    pub fn install(&self, engine: Arc<AudioEngine>) -> Result<()> {
        let mut slot = lock(&self.engine);
        if slot.is_some() {
            return Err(Error::InvalidState("an engine is already active".into()));
        }
        *slot = Some(engine);
        Ok(())
    }

    pub fn current(&self) -> Result<Arc<AudioEngine>> {
        self.get()
            .ok_or_else(|| Error::InvalidState("no active engine".into()))
    }

    pub fn get(&self) -> Option<Arc<AudioEngine>> {
        lock(&self.engine).clone()
    }

    pub fn remove(&self) -> Result<Arc<AudioEngine>> {
        lock(&self.engine)
            .take()
            .ok_or_else(|| Error::InvalidState("no active engine".into()))
    }

    pub fn is_occupied(&self) -> bool {
        lock(&self.engine).is_some()
    }
}

/// The collaborators a player builds each session from.
#[derive(Clone)]
pub struct Backends {
    pub decoders: Arc<dyn DecoderFactory>,
    pub outputs: Arc<dyn OutputFactory>,
    pub scalers: Arc<dyn ScalerFactory>,
}

impl Backends {
    /// Symphonia decoding, cpal output and SOLA time scaling.
    pub fn system() -> Self {
        Self {
            decoders: Arc::new(SymphoniaDecoderFactory),
            outputs: Arc::new(CpalOutputFactory),
            scalers: Arc::new(SolaScalerFactory),
        }
    }
}

pub type CompletionListener = Arc<dyn Fn() + Send + Sync>;

struct PlayerState {
    source: Option<PathBuf>,
    prepared: bool,
    released: bool,
    playing: bool,
    completed: bool,
    duration_millis: u64,
    /// Position to resume from while not playing.
    position_millis: u64,
    speed: f32,
    on_completion: Option<CompletionListener>,
}

/// Plays one source at a variable speed.
///
/// Each `start` runs a fresh engine session on a playback thread, beginning
/// at the remembered position. `pause` ends that session and remembers where
/// it got to.
pub struct VariableSpeedPlayer {
    params: EngineParameters,
    backends: Backends,
    slot: Arc<EngineSlot>,
    state: Arc<Mutex<PlayerState>>,
    playback: Option<JoinHandle<()>>,
}

impl VariableSpeedPlayer {
    pub fn new(params: EngineParameters, backends: Backends) -> Result<Self> {
        params.validate()?;
        let speed = params.initial_rate;
        Ok(Self {
            params,
            backends,
            slot: Arc::new(EngineSlot::new()),
            state: Arc::new(Mutex::new(PlayerState {
                source: None,
                prepared: false,
                released: false,
                playing: false,
                completed: false,
                duration_millis: 0,
                position_millis: 0,
                speed,
                on_completion: None,
            })),
            playback: None,
        })
    }

    fn check_not_released(&self) -> Result<()> {
        if lock(&self.state).released {
            return Err(Error::InvalidState("player has been released".into()));
        }
        Ok(())
    }

    pub fn set_data_source(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.check_not_released()?;
        self.stop_playback();
        let mut state = lock(&self.state);
        state.source = Some(path.as_ref().to_path_buf());
        state.prepared = false;
        state.completed = false;
        state.position_millis = 0;
        state.duration_millis = 0;
        Ok(())
    }

    /// Opens the source once to learn its duration.
    pub fn prepare(&mut self) -> Result<()> {
        self.check_not_released()?;
        let source = lock(&self.state)
            .source
            .clone()
            .ok_or_else(|| Error::InvalidState("no data source set".into()))?;

        let mut decoder = self.backends.decoders.open(&source, &self.params)?;
        let duration = decoder.duration_millis().unwrap_or(0);
        if let Err(e) = decoder.stop() {
            warn!("Failed to close probe decoder: {}", e);
        }

        let mut state = lock(&self.state);
        state.duration_millis = duration;
        state.prepared = true;
        info!("Prepared {} ({} ms)", source.display(), duration);
        Ok(())
    }

    pub fn duration_millis(&self) -> u64 {
        lock(&self.state).duration_millis
    }

    /// Starts playback from the remembered position.
    pub fn start(&mut self) -> Result<()> {
        self.check_not_released()?;
        if self.is_playing() {
            return Ok(());
        }
        // Reap a session that finished on its own.
        self.stop_playback();

        let (source, params) = {
            let mut state = lock(&self.state);
            if !state.prepared {
                return Err(Error::InvalidState("start called before prepare".into()));
            }
            let source = state
                .source
                .clone()
                .ok_or_else(|| Error::InvalidState("no data source set".into()))?;
            if state.completed {
                state.completed = false;
                state.position_millis = 0;
            }
            let params = EngineParameters {
                start_position_millis: state.position_millis,
                initial_rate: state.speed,
                ..self.params.clone()
            };
            (source, params)
        };

        let scaler = self.backends.scalers.create(&params);
        let engine = Arc::new(AudioEngine::new(
            params,
            scaler,
            Arc::clone(&self.backends.outputs),
        )?);
        let decoder = self.backends.decoders.open(&source, engine.params())?;

        self.slot.install(Arc::clone(&engine))?;
        engine.request_start();
        lock(&self.state).playing = true;

        let slot = Arc::clone(&self.slot);
        let state = Arc::clone(&self.state);
        let spawned = thread::Builder::new()
            .name("varispeed-playback".into())
            .spawn(move || {
                let result = engine.play_from_source(decoder);
                let _ = slot.remove();
                finish_session(&engine, &state, result);
            });

        match spawned {
            Ok(handle) => {
                self.playback = Some(handle);
                Ok(())
            }
            Err(e) => {
                let _ = self.slot.remove();
                lock(&self.state).playing = false;
                Err(e.into())
            }
        }
    }

    /// Stops playback, remembering the position to resume from.
    pub fn pause(&mut self) -> Result<()> {
        self.check_not_released()?;
        self.stop_playback();
        Ok(())
    }

    /// Moves to `position_millis`, clamped to the duration. Playback
    /// continues from there if it was running.
    pub fn seek_to(&mut self, position_millis: u64) -> Result<()> {
        self.check_not_released()?;
        let was_playing = self.is_playing();
        self.stop_playback();
        {
            let mut state = lock(&self.state);
            let limit = if state.duration_millis > 0 {
                state.duration_millis
            } else {
                u64::MAX
            };
            state.position_millis = position_millis.min(limit);
            state.completed = false;
        }
        if was_playing {
            self.start()?;
        }
        Ok(())
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.state).playing
    }

    /// Live position while playing, otherwise where playback would resume.
    pub fn current_position_millis(&self) -> u64 {
        if self.is_playing() {
            if let Some(engine) = self.slot.get() {
                return engine.current_position_millis();
            }
        }
        lock(&self.state).position_millis
    }

    /// Sets the playback speed, applying it at once if playing.
    pub fn set_variable_speed(&mut self, speed: f32) -> Result<()> {
        self.check_not_released()?;
        if !(speed.is_finite() && speed > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "speed must be a positive number, got {}",
                speed
            )));
        }
        lock(&self.state).speed = speed;
        if let Some(engine) = self.slot.get() {
            engine.set_speed(speed)?;
        }
        Ok(())
    }

    /// Called when playback reaches the end of the source. Not called when
    /// playback is stopped through the player.
    pub fn set_on_completion<F>(&mut self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.state).on_completion = Some(Arc::new(listener));
    }

    /// Returns to the freshly constructed state, keeping the listener.
    pub fn reset(&mut self) -> Result<()> {
        self.check_not_released()?;
        self.stop_playback();
        let mut state = lock(&self.state);
        state.source = None;
        state.prepared = false;
        state.completed = false;
        state.duration_millis = 0;
        state.position_millis = 0;
        state.speed = self.params.initial_rate;
        Ok(())
    }

    /// Stops playback for good. Every later call fails.
    pub fn release(&mut self) {
        self.stop_playback();
        let mut state = lock(&self.state);
        state.released = true;
        state.on_completion = None;
    }

    pub fn engine_slot(&self) -> &EngineSlot {
        &self.slot
    }

    fn stop_playback(&mut self) {
        let Some(handle) = self.playback.take() else {
            return;
        };
        if let Some(engine) = self.slot.get() {
            let position = engine.current_position_millis();
            engine.request_stop();
            lock(&self.state).position_millis = position;
            debug!("Stopping playback at {} ms", position);
        }
        if handle.join().is_err() {
            warn!("Playback thread panicked");
        }
        lock(&self.state).playing = false;
    }
}

impl Drop for VariableSpeedPlayer {
    fn drop(&mut self) {
        self.stop_playback();
    }
}

/// Records how a session ended and notifies the listener on natural completion.
fn finish_session(engine: &AudioEngine, state: &Mutex<PlayerState>, result: Result<()>) {
    let stopped_by_caller = engine.is_stop_requested();
    let listener = {
        let mut state = lock(state);
        state.playing = false;
        if stopped_by_caller {
            None
        } else if let Err(e) = &result {
            warn!("Playback ended with error: {}", e);
            state.position_millis = engine.current_position_millis();
            None
        } else {
            if state.duration_millis == 0 {
                state.duration_millis = engine.total_duration_millis();
            }
            state.completed = true;
            state.position_millis = if state.duration_millis > 0 {
                state.duration_millis
            } else {
                engine.current_position_millis()
            };
            state.on_completion.clone()
        }
    };

    if let Some(listener) = listener {
        debug!("Playback complete");
        listener();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dsp::sola::SolaScaler;

    struct NoOutput;

    impl OutputFactory for NoOutput {
        fn create(
            &self,
            _sample_rate: u32,
            _channels: usize,
        ) -> Result<Box<dyn crate::engine::output::OutputSink>> {
            Err(Error::AudioOutput("unused".into()))
        }
    }

    fn engine() -> Arc<AudioEngine> {
        let params = EngineParameters::default();
        let scaler = Box::new(SolaScaler::from_params(&params));
        Arc::new(AudioEngine::new(params, scaler, Arc::new(NoOutput)).unwrap())
    }

    #[test]
    fn test_slot_holds_one_engine() {
        let slot = EngineSlot::new();
        assert!(!slot.is_occupied());
        assert!(matches!(slot.current(), Err(Error::InvalidState(_))));

        let first = engine();
        slot.install(first.clone()).unwrap();
        assert!(slot.is_occupied());
        assert!(Arc::ptr_eq(&slot.current().unwrap(), &first));

        assert!(matches!(slot.install(engine()), Err(Error::InvalidState(_))));
        assert!(Arc::ptr_eq(&slot.current().unwrap(), &first));
    }

    #[test]
    fn test_slot_remove() {
        let slot = EngineSlot::new();
        assert!(slot.remove().is_err());

        slot.install(engine()).unwrap();
        slot.remove().unwrap();
        assert!(!slot.is_occupied());
        slot.install(engine()).unwrap();
    }
}
