//! Exponential moving average

use crate::error::{ClusterError, ClusterResult};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default, Clone, Copy)]
struct EmaState {
    value: f64,
    initialized: bool,
}

/// Thread-safe exponential moving average
///
/// The first sample sets the value directly; every later sample `x`
/// applies `v <- alpha * x + (1 - alpha) * v`.
#[derive(Debug)]
pub struct Ema {
    alpha: f64,
    state: Mutex<EmaState>,
}

impl Ema {
    /// Create a tracker with smoothing factor `alpha` in the open interval (0, 1)
    pub fn new(alpha: f64) -> ClusterResult<Self> {
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(ClusterError::InvalidConfig(format!(
                "EMA alpha must be within (0, 1), got {alpha}"
            )));
        }
        Ok(Self {
            alpha,
            state: Mutex::new(EmaState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, EmaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Feed a sample and return the updated value
    pub fn update(&self, x: f64) -> f64 {
        let mut state = self.lock();
        if state.initialized {
            // Same recurrence, written so that x == v leaves v bit-identical
            state.value += self.alpha * (x - state.value);
        } else {
            state.value = x;
            state.initialized = true;
        }
        state.value
    }

    /// Current value, 0 before the first sample
    pub fn value(&self) -> f64 {
        self.lock().value
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }
}
