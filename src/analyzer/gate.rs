//! RMS noise gate with an adaptive floor and hysteresis.

use crate::config::AnalyzerConfig;

/// Gate edge produced by one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateTransition {
    Opened,
    Closed,
}

/// Gate state after one update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateReading {
    pub speaking: bool,
    pub transition: Option<GateTransition>,
    /// Excess energy over the floor, normalized to the remaining headroom.
    pub normalized: f32,
    pub noise_floor: f32,
}

#[derive(Debug, Clone)]
pub struct NoiseGate {
    noise_floor: f32,
    initial_floor: f32,
    floor_alpha: f32,
    open_margin: f32,
    close_margin: f32,
    speaking: bool,
}

impl NoiseGate {
    #[must_use]
    pub fn new(config: &AnalyzerConfig) -> Self {
        let initial_floor = config.initial_noise_floor.clamp(0.0, 0.99);
        Self {
            noise_floor: initial_floor,
            initial_floor,
            floor_alpha: config.noise_floor_alpha.clamp(0.0, 1.0),
            open_margin: config.open_margin,
            close_margin: config.close_margin.min(config.open_margin),
            speaking: false,
        }
    }

    /// Feed one RMS reading.
    pub fn update(&mut self, rms: f32) -> GateReading {
        let rms = if rms.is_finite() { rms.max(0.0) } else { 0.0 };
        let was_speaking = self.speaking;

        if self.speaking {
            if rms < self.noise_floor + self.close_margin {
                self.speaking = false;
            }
        } else if rms > self.noise_floor + self.open_margin {
            self.speaking = true;
        }

        // The floor tracks background noise only; speech must not raise it.
        if !self.speaking {
            self.noise_floor += self.floor_alpha * (rms - self.noise_floor);
            self.noise_floor = self.noise_floor.clamp(0.0, 0.99);
        }

        let headroom = (1.0 - self.noise_floor).max(f32::EPSILON);
        let normalized = ((rms - self.noise_floor) / headroom).clamp(0.0, 1.0);

        let transition = match (was_speaking, self.speaking) {
            (false, true) => Some(GateTransition::Opened),
            (true, false) => Some(GateTransition::Closed),
            _ => None,
        };

        GateReading {
            speaking: self.speaking,
            transition,
            normalized,
            noise_floor: self.noise_floor,
        }
    }

    #[must_use]
    pub fn speaking(&self) -> bool {
        self.speaking
    }

    #[must_use]
    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    pub fn reset(&mut self) {
        self.noise_floor = self.initial_floor;
        self.speaking = false;
    }
}

/// Compute RMS energy of audio samples.
pub fn compute_rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
