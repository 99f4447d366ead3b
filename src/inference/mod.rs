//! llama-cpp backing layer
//!
//! Everything that touches llama-cpp: model loading and validation, the
//! worker-thread engine, sampler construction, and the streaming
//! channel protocol.

pub mod engine;
pub mod model;
pub mod sampler;
pub mod streaming;

// Re-export main types for convenience
pub use engine::{EngineError, GenerationOutput, LlamaEngine, LoadedModelInfo, SessionConfig};
pub use model::{is_gguf_file, validate_gguf, GgufHeader, ModelError, GGUF_MAGIC};
pub use streaming::StreamEvent;
