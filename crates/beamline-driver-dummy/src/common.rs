//! Shared pieces of the simulated devices.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::time::Duration;

/// How closely a simulated device follows real hardware timing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulationMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - motion takes time, frames take exposure time
    Realistic,
}

impl SimulationMode {
    /// `delay` in realistic mode, zero otherwise.
    pub fn scale(&self, delay: Duration) -> Duration {
        match self {
            SimulationMode::Instant => Duration::ZERO,
            SimulationMode::Realistic => delay,
        }
    }
}

/// Seeded RNG shared between the callbacks of one device.
pub struct SimRng {
    inner: Mutex<StdRng>,
}

impl SimRng {
    /// Seeded for reproducible sequences, or from entropy with `None`.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f64(&self) -> f64 {
        self.inner.lock().gen()
    }

    /// Uniform in `[0, max)`.
    pub fn below(&self, max: u16) -> u16 {
        if max == 0 {
            return 0;
        }
        self.inner.lock().gen_range(0..max)
    }
}

impl Default for SimRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for SimRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimRng").finish_non_exhaustive()
    }
}

/// Sleep unless `delay` is zero.
pub(crate) fn pause(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}
