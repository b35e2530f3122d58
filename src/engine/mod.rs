pub mod buffer;
pub mod decoder;
pub mod dsp;
pub mod engine;
pub mod output;
pub mod scaler_adapter;
pub mod session;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use engine::{AudioEngine, PipelineState};
pub use session::{Backends, EngineSlot, VariableSpeedPlayer};

/// Locks `mutex`, recovering the guard if another thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
