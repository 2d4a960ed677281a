//! Random sources for the failure model
//!
//! Every container simulation task and the fault injector draw from their
//! own generator. Generators come from an injected [`RngFactory`] so tests
//! can pin the sequence.

use crate::models::ContainerId;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Owned generator handed to a single task
pub type BoxedRng = Box<dyn RngCore + Send>;

/// Stream index reserved for the fault injector
const INJECTOR_STREAM: u64 = u64::MAX;

/// Golden-ratio multiplier used to spread stream indices across the seed space
const STREAM_SPREAD: u64 = 0x9E37_79B9_7F4A_7C15;

/// Produces random number generators for simulation tasks
pub trait RngFactory: Send + Sync {
    /// Generator for the simulation task of the given container
    fn for_container(&self, id: ContainerId) -> BoxedRng;

    /// Generator for the fault injector
    fn for_injector(&self) -> BoxedRng;
}

/// `StdRng`-backed factory, deterministic when a seed is given
#[derive(Debug, Clone, Copy, Default)]
pub struct SeededRngFactory {
    seed: Option<u64>,
}

impl SeededRngFactory {
    pub fn new(seed: Option<u64>) -> Self {
        Self { seed }
    }

    /// Factory seeding every generator from OS entropy
    pub fn from_entropy() -> Self {
        Self { seed: None }
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    fn stream(&self, index: u64) -> BoxedRng {
        match self.seed {
            Some(seed) => Box::new(StdRng::seed_from_u64(
                seed ^ index.wrapping_mul(STREAM_SPREAD),
            )),
            None => Box::new(StdRng::from_entropy()),
        }
    }
}

impl RngFactory for SeededRngFactory {
    fn for_container(&self, id: ContainerId) -> BoxedRng {
        self.stream(id)
    }

    fn for_injector(&self) -> BoxedRng {
        self.stream(INJECTOR_STREAM)
    }
}
