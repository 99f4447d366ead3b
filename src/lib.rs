//! genloop
//!
//! Controller for a single stateful llama-cpp text-generation session:
//! sliding context window with half-window eviction, bounded batch
//! submission, per-request sampler pipelines, and UTF-8-safe streaming.

pub mod config;
pub mod inference;
pub mod session;
