//! Run configuration
//!
//! Serializable configuration for the CLI: model path, session sizing,
//! hardware knobs and default generation parameters. Loaded from a JSON
//! file when one is given; bad values are clamped rather than rejected.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::inference::SessionConfig;
use crate::session::GenerationParams;

/// Full run configuration for one model session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Path to the GGUF model file
    pub model_path: PathBuf,
    /// Context capacity in positions
    pub context_size: u32,
    /// Maximum tokens per submitted batch
    pub batch_limit: u32,
    /// Worker threads for the forward pass
    pub threads: u32,
    /// Number of layers to offload to GPU (0 = CPU only)
    pub gpu_layers: u32,
    /// Memory-map the model file
    pub use_mmap: bool,
    /// Enable flash attention kernels
    pub flash_attention: bool,
    /// Default generation parameters
    pub generation: GenerationParams,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            context_size: 4096,
            batch_limit: 512,
            threads: 4,
            gpu_layers: 0,
            use_mmap: true,
            flash_attention: false,
            generation: GenerationParams::default(),
        }
    }
}

impl RunConfig {
    /// Clamp out-of-range values to something usable.
    pub fn validate(&mut self) {
        if self.context_size == 0 {
            self.context_size = 4096;
        }
        if self.batch_limit == 0 {
            self.batch_limit = 512;
        }
        // A batch larger than the context can never be submitted whole
        self.batch_limit = self.batch_limit.min(self.context_size);
        if self.threads == 0 {
            self.threads = 4;
        }
        self.generation.validate();
    }

    /// The session configuration slice of this run config.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            context_size: self.context_size,
            batch_limit: self.batch_limit,
            threads: self.threads,
            gpu_layers: self.gpu_layers,
            use_mmap: self.use_mmap,
            flash_attention: self.flash_attention,
        }
    }
}

/// Loads a config file, falling back to defaults if it is missing or
/// does not parse.
pub fn load_config<P: AsRef<Path>>(path: P) -> RunConfig {
    let path = path.as_ref();
    let mut config = match std::fs::read_to_string(path) {
        Ok(json) => match serde_json::from_str(&json) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to parse {:?}, using defaults: {}", path, e);
                RunConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read {:?}, using defaults: {}", path, e);
            RunConfig::default()
        }
    };
    config.validate();
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_survive_validate() {
        let mut config = RunConfig::default();
        config.validate();
        assert_eq!(config.context_size, 4096);
        assert_eq!(config.batch_limit, 512);
    }

    #[test]
    fn test_validate_clamps_batch_to_context() {
        let mut config = RunConfig {
            context_size: 256,
            batch_limit: 1024,
            ..Default::default()
        };
        config.validate();
        assert_eq!(config.batch_limit, 256);
    }

    #[test]
    fn test_json_round_trip() {
        let config = RunConfig {
            model_path: PathBuf::from("/models/test.gguf"),
            context_size: 2048,
            gpu_layers: 32,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: RunConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.model_path, config.model_path);
        assert_eq!(back.context_size, 2048);
        assert_eq!(back.gpu_layers, 32);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"context_size": 1024}"#).unwrap();
        file.flush().unwrap();

        let config = load_config(file.path());
        assert_eq!(config.context_size, 1024);
        assert_eq!(config.batch_limit, 512);
    }

    #[test]
    fn test_garbage_file_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not json").unwrap();
        file.flush().unwrap();

        let config = load_config(file.path());
        assert_eq!(config.context_size, 4096);
    }
}
