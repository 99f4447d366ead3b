//! Inference engine implementation
//!
//! Drives a single llama-cpp session behind the controller in
//! [`crate::session`].
//!
//! # Architecture
//!
//! llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`)
//! contain raw pointers that are not `Send`, so all backend work runs on
//! a dedicated worker thread. The main thread communicates via channels.
//! The context, sampler pipeline and batch storage are created fresh for
//! every generation request and released by ownership on every exit
//! path, including failures.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use thiserror::Error;

use crate::inference::model::{validate_gguf, ModelError};
use crate::inference::sampler::build_sampler;
use crate::inference::streaming::StreamEvent;
use crate::session::{
    Batch, ContextShift, GenerationParams, ModelBackend, Session, SinkVerdict, StopReason, Token,
};

/// Errors that can occur during engine operations
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Backend not initialized")]
    BackendNotInitialized,

    #[error("No model loaded")]
    NoModelLoaded,

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Fixed per-session configuration, set once at model load.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Context capacity in positions
    pub context_size: u32,
    /// Maximum tokens per submitted batch
    pub batch_limit: u32,
    /// Worker threads for the forward pass (clamped to available cores)
    pub threads: u32,
    /// Number of layers to offload to GPU (0 = CPU only)
    pub gpu_layers: u32,
    /// Memory-map the model file instead of reading it up front
    pub use_mmap: bool,
    /// Enable flash attention kernels
    pub flash_attention: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            context_size: 4096,
            batch_limit: 512,
            threads: 4,
            gpu_layers: 0,
            use_mmap: true,
            flash_attention: false,
        }
    }
}

/// Model information after loading
#[derive(Debug, Clone)]
pub struct LoadedModelInfo {
    /// Path to the loaded model
    pub path: String,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Embedding dimension
    pub embedding_dim: i32,
    /// Training context length
    pub context_length: u32,
    /// Total parameter count
    pub param_count: u64,
    /// Model size in bytes
    pub size_bytes: u64,
}

/// Final result of a synchronous generation request.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub text: String,
    pub reason: StopReason,
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Init,
    LoadModel {
        path: PathBuf,
        config: SessionConfig,
        response_tx: Sender<Result<LoadedModelInfo, EngineError>>,
    },
    UnloadModel,
    Generate {
        prompt: String,
        params: GenerationParams,
        event_tx: Sender<StreamEvent>,
        stop_signal: Arc<AtomicBool>,
    },
    Tokenize {
        text: String,
        response_tx: Sender<Result<Vec<Token>, EngineError>>,
    },
    Shutdown,
}

/// The inference engine: session lifecycle plus the three request kinds
/// (synchronous generation, streaming generation, raw tokenization).
///
/// Uses a dedicated worker thread for all llama-cpp operations since the
/// underlying types are not Send.
pub struct LlamaEngine {
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
    /// Cached model info (updated after load)
    model_info: Option<LoadedModelInfo>,
    /// Whether backend is initialized
    initialized: bool,
    /// Whether a model is loaded
    model_loaded: bool,
}

impl LlamaEngine {
    /// Creates a new uninitialized engine
    pub fn new() -> Self {
        Self {
            command_tx: None,
            worker_handle: None,
            model_info: None,
            initialized: false,
            model_loaded: false,
        }
    }

    /// Initializes the llama.cpp backend
    ///
    /// Must be called before loading models or running inference.
    /// Spawns the worker thread that owns all llama-cpp state.
    pub fn init(&mut self) -> Result<(), EngineError> {
        if self.initialized {
            return Ok(());
        }

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();

        let handle = thread::spawn(move || {
            worker_thread_main(command_rx);
        });

        self.command_tx = Some(command_tx.clone());
        self.worker_handle = Some(handle);

        command_tx
            .send(WorkerCommand::Init)
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        self.initialized = true;
        tracing::info!("LlamaEngine worker thread started");
        Ok(())
    }

    /// Loads a GGUF model and fixes the session configuration
    /// (context capacity, batch limit, hardware knobs) for its lifetime.
    pub fn load_model<P: AsRef<Path>>(
        &mut self,
        path: P,
        config: SessionConfig,
    ) -> Result<LoadedModelInfo, EngineError> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or(EngineError::BackendNotInitialized)?;

        let path = path.as_ref();

        // Validate the GGUF header first (just file I/O, main thread)
        let header = validate_gguf(path)?;
        tracing::debug!("GGUF v{} header accepted for {:?}", header.version, path);

        let (response_tx, response_rx) = mpsc::channel();
        command_tx
            .send(WorkerCommand::LoadModel {
                path: path.to_path_buf(),
                config,
                response_tx,
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let result = response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))??;

        self.model_info = Some(result.clone());
        self.model_loaded = true;

        Ok(result)
    }

    /// Unloads the current model and frees its memory
    pub fn unload_model(&mut self) {
        if let Some(tx) = &self.command_tx {
            let _ = tx.send(WorkerCommand::UnloadModel);
        }
        self.model_info = None;
        self.model_loaded = false;
        tracing::info!("Model unload requested");
    }

    /// Returns information about the currently loaded model
    pub fn model_info(&self) -> Option<&LoadedModelInfo> {
        self.model_info.as_ref()
    }

    /// Returns true if a model is currently loaded
    pub fn is_model_loaded(&self) -> bool {
        self.model_loaded
    }

    /// Returns true if the backend is initialized
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Generates text with streaming output.
    ///
    /// Returns the event receiver and a stop flag. Raising the flag (or
    /// dropping the receiver) cancels generation at the next chunk
    /// boundary; the stream then ends with `Done(Cancelled)`.
    pub fn generate_stream(
        &self,
        prompt: &str,
        params: GenerationParams,
    ) -> Result<(Receiver<StreamEvent>, Arc<AtomicBool>), EngineError> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or(EngineError::BackendNotInitialized)?;

        if !self.model_loaded {
            return Err(EngineError::NoModelLoaded);
        }

        let (event_tx, event_rx) = mpsc::channel();
        let stop_signal = Arc::new(AtomicBool::new(false));

        command_tx
            .send(WorkerCommand::Generate {
                prompt: prompt.to_string(),
                params,
                event_tx,
                stop_signal: stop_signal.clone(),
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        Ok((event_rx, stop_signal))
    }

    /// Generates text synchronously by draining the stream. Output
    /// produced before a mid-generation decode failure is kept; the
    /// failure is reported through [`GenerationOutput::reason`].
    pub fn generate(
        &self,
        prompt: &str,
        params: GenerationParams,
    ) -> Result<GenerationOutput, EngineError> {
        let (event_rx, _stop) = self.generate_stream(prompt, params)?;

        let mut text = String::new();
        loop {
            match event_rx.recv() {
                Ok(StreamEvent::Chunk(chunk)) => text.push_str(&chunk),
                Ok(StreamEvent::Done(reason)) => return Ok(GenerationOutput { text, reason }),
                Ok(StreamEvent::Error(e)) => return Err(EngineError::Inference(e)),
                Err(_) => {
                    return Err(EngineError::WorkerError(
                        "worker closed the event channel".to_string(),
                    ))
                }
            }
        }
    }

    /// Tokenizes text without touching session state.
    pub fn tokenize(&self, text: &str) -> Result<Vec<Token>, EngineError> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or(EngineError::BackendNotInitialized)?;

        if !self.model_loaded {
            return Err(EngineError::NoModelLoaded);
        }

        let (response_tx, response_rx) = mpsc::channel();
        command_tx
            .send(WorkerCommand::Tokenize {
                text: text.to_string(),
                response_tx,
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))?
    }
}

impl Default for LlamaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        // Send shutdown command
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        // Wait for worker thread to finish
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
///
/// Owns the LlamaBackend and LlamaModel, processes commands from the
/// main thread until shutdown.
fn worker_thread_main(command_rx: Receiver<WorkerCommand>) {
    let mut backend: Option<LlamaBackend> = None;
    let mut model: Option<LlamaModel> = None;
    let mut session_config = SessionConfig::default();

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Init) => match LlamaBackend::init() {
                Ok(b) => {
                    backend = Some(b);
                    tracing::info!("LlamaBackend initialized in worker thread");
                }
                Err(e) => {
                    tracing::error!("Failed to init backend: {}", e);
                }
            },
            Ok(WorkerCommand::LoadModel {
                path,
                config,
                response_tx,
            }) => match load_model_internal(&backend, &path, &config) {
                Ok((m, info)) => {
                    model = Some(m);
                    session_config = config;
                    tracing::info!("Model loaded: {}", info.path);
                    let _ = response_tx.send(Ok(info));
                }
                Err(e) => {
                    let _ = response_tx.send(Err(e));
                }
            },
            Ok(WorkerCommand::UnloadModel) => {
                model = None;
                tracing::info!("Model unloaded in worker thread");
            }
            Ok(WorkerCommand::Generate {
                prompt,
                params,
                event_tx,
                stop_signal,
            }) => {
                if let (Some(ref b), Some(ref m)) = (&backend, &model) {
                    if let Err(e) = run_generation(
                        b,
                        m,
                        &session_config,
                        &prompt,
                        params,
                        &event_tx,
                        &stop_signal,
                    ) {
                        let _ = event_tx.send(StreamEvent::Error(e));
                    }
                } else {
                    let _ = event_tx.send(StreamEvent::Error("No model loaded".to_string()));
                }
            }
            Ok(WorkerCommand::Tokenize { text, response_tx }) => {
                let result = match &model {
                    Some(m) => m
                        .str_to_token(&text, AddBos::Always)
                        .map(|tokens| tokens.iter().map(|t| t.0).collect())
                        .map_err(|e| EngineError::Tokenization(e.to_string())),
                    None => Err(EngineError::NoModelLoaded),
                };
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                // Channel closed, exit
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

/// Load the model and extract its info (helper for worker thread)
fn load_model_internal(
    backend: &Option<LlamaBackend>,
    path: &Path,
    config: &SessionConfig,
) -> Result<(LlamaModel, LoadedModelInfo), EngineError> {
    let backend = backend.as_ref().ok_or(EngineError::BackendNotInitialized)?;

    let model_params = LlamaModelParams::default()
        .with_n_gpu_layers(config.gpu_layers)
        .with_use_mmap(config.use_mmap);

    let model = LlamaModel::load_from_file(backend, path, &model_params)
        .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

    let info = LoadedModelInfo {
        path: path.to_string_lossy().to_string(),
        vocab_size: model.n_vocab(),
        embedding_dim: model.n_embd(),
        context_length: model.n_ctx_train(),
        param_count: model.n_params() as u64,
        size_bytes: model.size() as u64,
    };

    tracing::info!(
        "Model info extracted: {} ({} params, {} vocab, {} train ctx, session ctx {})",
        info.path,
        info.param_count,
        info.vocab_size,
        info.context_length,
        config.context_size
    );

    Ok((model, info))
}

/// Requested thread count clamped to what the machine can give while
/// leaving headroom for the rest of the process.
fn clamp_threads(requested: u32) -> i32 {
    let cores = thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4);
    std::cmp::max(2, std::cmp::min(requested as i32, cores - 2))
}

/// Adapter giving the session controller access to one request's worth
/// of llama-cpp state: the context, a fresh sampler pipeline and the
/// reusable batch storage. Dropped when the request ends.
struct LlamaSessionBackend<'m> {
    ctx: LlamaContext<'m>,
    model: &'m LlamaModel,
    sampler: LlamaSampler,
    batch: LlamaBatch,
}

impl ModelBackend for LlamaSessionBackend<'_> {
    fn tokenize(&self, text: &str) -> Result<Vec<Token>, String> {
        self.model
            .str_to_token(text, AddBos::Always)
            .map(|tokens| tokens.iter().map(|t| t.0).collect())
            .map_err(|e| format!("Failed to tokenize: {e}"))
    }

    fn decode(&mut self, batch: &Batch) -> Result<(), String> {
        self.batch.clear();
        for entry in batch.entries() {
            self.batch
                .add(
                    LlamaToken(entry.token),
                    entry.pos as i32,
                    &[entry.seq],
                    entry.wants_output,
                )
                .map_err(|e| format!("Failed to add token to batch: {e}"))?;
        }
        self.ctx
            .decode(&mut self.batch)
            .map_err(|e| format!("Failed to decode: {e}"))
    }

    fn sample(&mut self) -> Token {
        self.sampler.sample(&self.ctx, self.batch.n_tokens() - 1).0
    }

    fn accept(&mut self, token: Token) {
        self.sampler.accept(LlamaToken(token));
    }

    fn is_stop(&self, token: Token) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn token_bytes(&mut self, token: Token) -> Result<Vec<u8>, String> {
        self.model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .map_err(|e| format!("Failed to convert token to bytes: {e}"))
    }

    fn shift(&mut self, shift: &ContextShift) -> Result<(), String> {
        let evict_end = shift.keep_start + shift.discard;
        self.ctx
            .kv_cache_seq_rm(0, Some(shift.keep_start), Some(evict_end))
            .map_err(|e| format!("Failed to evict context positions: {e}"))?;
        self.ctx
            .kv_cache_seq_add(
                0,
                Some(evict_end),
                Some(shift.end),
                -(shift.discard as i32),
            )
            .map_err(|e| format!("Failed to renumber context positions: {e}"))?;
        Ok(())
    }

    fn clear_memory(&mut self) {
        self.ctx.clear_kv_cache();
    }
}

/// Run one generation request (called from the worker thread)
fn run_generation(
    backend: &LlamaBackend,
    model: &LlamaModel,
    config: &SessionConfig,
    prompt: &str,
    params: GenerationParams,
    tx: &Sender<StreamEvent>,
    stop_signal: &Arc<AtomicBool>,
) -> Result<(), String> {
    let n_ctx = NonZeroU32::new(config.context_size)
        .ok_or_else(|| "context size must be nonzero".to_string())?;
    let threads = clamp_threads(config.threads);

    // llama_flash_attn_type: 0 = disabled, 1 = enabled
    let flash_policy = if config.flash_attention { 1 } else { 0 };
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(Some(n_ctx))
        .with_n_batch(config.batch_limit)
        .with_n_threads(threads)
        .with_n_threads_batch(threads)
        .with_flash_attention_policy(flash_policy);

    let ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| format!("Failed to create context: {e}"))?;

    let mut llama = LlamaSessionBackend {
        ctx,
        model,
        sampler: build_sampler(&params.sampling),
        batch: LlamaBatch::new(config.batch_limit as usize, 1),
    };

    let mut session = Session::new(config.context_size, config.batch_limit as usize);

    // Cancellation carriers: the explicit stop flag and a dropped
    // receiver both turn into a Stop verdict at the chunk boundary.
    let mut sink = |chunk: &str| {
        if stop_signal.load(Ordering::Relaxed) {
            tracing::debug!("Generation stopped by user");
            return SinkVerdict::Stop;
        }
        if tx.send(StreamEvent::Chunk(chunk.to_string())).is_err() {
            tracing::debug!("Receiver dropped, stopping generation");
            return SinkVerdict::Stop;
        }
        SinkVerdict::Continue
    };

    let generation = session
        .generate(&mut llama, prompt, &params, &mut sink)
        .map_err(|e| e.to_string())?;

    tracing::debug!(
        "Generation finished: {} tokens, {:?}",
        generation.tokens_generated,
        generation.reason
    );
    let _ = tx.send(StreamEvent::Done(generation.reason));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_new() {
        let engine = LlamaEngine::new();
        assert!(!engine.is_initialized());
        assert!(!engine.is_model_loaded());
        assert!(engine.model_info().is_none());
    }

    #[test]
    fn test_generate_without_init() {
        let engine = LlamaEngine::new();
        let result = engine.generate_stream("hi", GenerationParams::default());
        assert!(matches!(result, Err(EngineError::BackendNotInitialized)));
    }

    #[test]
    fn test_tokenize_without_init() {
        let engine = LlamaEngine::new();
        assert!(matches!(
            engine.tokenize("hi"),
            Err(EngineError::BackendNotInitialized)
        ));
    }

    #[test]
    fn test_unload_without_model() {
        let mut engine = LlamaEngine::new();
        // Should not panic
        engine.unload_model();
        assert!(!engine.is_model_loaded());
    }

    #[test]
    fn test_clamp_threads_floor() {
        assert!(clamp_threads(0) >= 2);
        assert!(clamp_threads(1) >= 2);
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.context_size, 4096);
        assert_eq!(config.batch_limit, 512);
        assert!(config.use_mmap);
    }
}
