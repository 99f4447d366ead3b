//! Sampler pipeline construction
//!
//! Builds a fresh `LlamaSampler` chain from a [`SamplingConfig`] for
//! every generation request, so repeat-penalty history always starts
//! clean. Temperatures at or near zero fall back to greedy selection.

use llama_cpp_2::sampling::LlamaSampler;

use crate::session::SamplingConfig;

/// Tokens of history considered by the repeat penalty.
const PENALTY_LAST_N: i32 = 64;

/// Builds the per-request sampler pipeline. The returned sampler owns
/// its state and is dropped when the request ends.
pub fn build_sampler(config: &SamplingConfig) -> LlamaSampler {
    if config.temperature < 0.01 {
        return LlamaSampler::greedy();
    }

    let seed = if config.seed == 0 {
        entropy_seed()
    } else {
        config.seed
    };

    LlamaSampler::chain_simple([
        LlamaSampler::penalties(PENALTY_LAST_N, config.repeat_penalty, 0.0, 0.0),
        LlamaSampler::top_k(config.top_k as i32),
        LlamaSampler::top_p(config.top_p, 1),
        LlamaSampler::temp(config.temperature),
        LlamaSampler::dist(seed),
    ])
}

/// Generates a random seed using system entropy
fn entropy_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
