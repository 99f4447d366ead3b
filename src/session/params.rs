//! Generation parameters
//!
//! Sampling knobs and the per-request budget. A `SamplingConfig` is
//! immutable for the lifetime of one generation request; the sampler
//! pipeline built from it is discarded when the request ends.

use serde::{Deserialize, Serialize};

/// Sampling configuration for one generation request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Temperature (0.0 = greedy, higher = more random)
    pub temperature: f32,
    /// Top-p (nucleus) cutoff
    pub top_p: f32,
    /// Top-k candidate cutoff (0 = disabled)
    pub top_k: u32,
    /// Penalty applied to recently generated tokens
    pub repeat_penalty: f32,
    /// Random seed (0 = draw from system entropy)
    pub seed: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
            seed: 0,
        }
    }
}

impl SamplingConfig {
    /// Clamp out-of-range values to something usable rather than erroring.
    pub fn validate(&mut self) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);
        if self.top_k == 0 {
            self.top_k = 40;
        }
        if self.repeat_penalty <= 0.0 {
            self.repeat_penalty = 1.0;
        }
    }
}

/// Full parameter set for one generation request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    #[serde(flatten)]
    pub sampling: SamplingConfig,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            sampling: SamplingConfig::default(),
        }
    }
}

impl GenerationParams {
    pub fn validate(&mut self) {
        if self.max_tokens == 0 {
            self.max_tokens = 512;
        }
        self.sampling.validate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_in_range() {
        let mut p = GenerationParams::default();
        let before = p;
        p.validate();
        assert_eq!(p, before);
    }

    #[test]
    fn test_validate_clamps() {
        let mut s = SamplingConfig {
            temperature: 5.0,
            top_p: 1.5,
            top_k: 0,
            repeat_penalty: -1.0,
            seed: 7,
        };
        s.validate();
        assert!((s.temperature - 2.0).abs() < f32::EPSILON);
        assert!((s.top_p - 1.0).abs() < f32::EPSILON);
        assert_eq!(s.top_k, 40);
        assert!((s.repeat_penalty - 1.0).abs() < f32::EPSILON);
        assert_eq!(s.seed, 7);
    }

    #[test]
    fn test_zero_budget_gets_default() {
        let mut p = GenerationParams {
            max_tokens: 0,
            ..Default::default()
        };
        p.validate();
        assert_eq!(p.max_tokens, 512);
    }
}
