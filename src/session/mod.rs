//! Session controller core
//!
//! Backend-independent machinery for driving one autoregressive
//! generation session: context-window bookkeeping and eviction, batch
//! planning, UTF-8-safe stream assembly, and the request state machine.

pub mod batch;
pub mod controller;
pub mod params;
pub mod stream;
pub mod window;

// Re-export main types for convenience
pub use batch::{Batch, BatchBuilder, BatchEntry, Token};
pub use controller::{
    ChunkSink, GenerateError, Generation, Message, ModelBackend, Role, Session, SinkVerdict,
    StopReason,
};
pub use params::{GenerationParams, SamplingConfig};
pub use stream::StreamAssembler;
pub use window::{ContextShift, ContextWindow, WindowError, EVICTION_RESERVE};
