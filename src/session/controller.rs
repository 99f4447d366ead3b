//! Session controller
//!
//! Owns the generation state machine for a single model session: reset,
//! prompt submission in bounded batches, the sample/emit/decode loop,
//! and the terminal states it can end in. All model work goes through
//! the [`ModelBackend`] seam; the llama-cpp adapter lives in
//! `crate::inference` and tests drive the controller with a scripted
//! backend instead.

use thiserror::Error;

use crate::session::batch::{Batch, BatchBuilder, Token};
use crate::session::params::GenerationParams;
use crate::session::stream::StreamAssembler;
use crate::session::window::{ContextShift, ContextWindow, WindowError, EVICTION_RESERVE};

/// Who said what in the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged entry in the session history.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Everything the controller needs from the model side. The sampler
/// pipeline behind `sample`/`accept` must be freshly built per request
/// so repeat-penalty history never leaks between prompts.
pub trait ModelBackend {
    /// Tokenizes text without touching session state.
    fn tokenize(&self, text: &str) -> Result<Vec<Token>, String>;
    /// Submits one batch to the model.
    fn decode(&mut self, batch: &Batch) -> Result<(), String>;
    /// Draws the next token from the last output distribution.
    fn sample(&mut self) -> Token;
    /// Records a drawn token into repeat-penalty history.
    fn accept(&mut self, token: Token);
    /// True for end-of-generation tokens.
    fn is_stop(&self, token: Token) -> bool;
    /// Raw bytes of a token's text piece. May split a UTF-8 character.
    fn token_bytes(&mut self, token: Token) -> Result<Vec<u8>, String>;
    /// Applies a planned context shift to the backing KV memory.
    fn shift(&mut self, shift: &ContextShift) -> Result<(), String>;
    /// Clears the backing context memory on session reset.
    fn clear_memory(&mut self);
}

/// Why a generation loop ended. These are ordinary terminal states, not
/// errors; only a failure before any token is produced is an `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The model produced an end-of-generation token.
    StopToken,
    /// The configured token budget ran out.
    BudgetExhausted,
    /// The chunk consumer asked to stop.
    Cancelled,
    /// A decode call failed mid-loop; output up to that point stands.
    DecodeFailed(String),
}

/// Verdict returned by a [`ChunkSink`] after each delivered chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkVerdict {
    Continue,
    Stop,
}

/// Receives completed text chunks during generation. Cancellation is the
/// return value, not an unwind.
pub trait ChunkSink {
    fn deliver(&mut self, chunk: &str) -> SinkVerdict;
}

impl<F: FnMut(&str) -> SinkVerdict> ChunkSink for F {
    fn deliver(&mut self, chunk: &str) -> SinkVerdict {
        self(chunk)
    }
}

/// Errors that prevent a generation request from producing any output.
#[derive(Debug, Error, Clone)]
pub enum GenerateError {
    #[error("Prompt tokenized to nothing")]
    EmptyPrompt,

    #[error("Failed to tokenize prompt: {0}")]
    Tokenization(String),

    #[error("Failed to process prompt: {0}")]
    PromptDecode(String),

    #[error(transparent)]
    Window(#[from] WindowError),
}

/// Outcome of one completed generation request.
#[derive(Debug, Clone)]
pub struct Generation {
    /// All emitted chunks joined together.
    pub text: String,
    /// The chunks exactly as they were handed to the sink.
    pub chunks: Vec<String>,
    pub reason: StopReason,
    /// Tokens drawn from the sampler, stop token excluded.
    pub tokens_generated: u32,
}

/// A single-sequence generation session over a fixed-capacity context.
///
/// Created once per loaded model, reset at the start of every request,
/// dropped when the model is unloaded.
#[derive(Debug)]
pub struct Session {
    window: ContextWindow,
    batcher: BatchBuilder,
    history: Vec<Message>,
}

impl Session {
    pub fn new(capacity: u32, batch_limit: usize) -> Self {
        Self {
            window: ContextWindow::new(capacity),
            batcher: BatchBuilder::new(batch_limit),
            history: Vec::new(),
        }
    }

    pub fn window(&self) -> &ContextWindow {
        &self.window
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Clears history and the position cursor and asks the backend to
    /// clear context memory. Always happens before any batch of a new
    /// request is submitted.
    pub fn reset<B: ModelBackend>(&mut self, backend: &mut B) {
        self.history.clear();
        self.window.reset();
        backend.clear_memory();
    }

    /// Runs one full generation request: reset, tokenize, prompt
    /// submission, then the token loop. Completed chunks go to `sink` as
    /// they become available; the joined text comes back in the result.
    pub fn generate<B: ModelBackend, S: ChunkSink>(
        &mut self,
        backend: &mut B,
        prompt: &str,
        params: &GenerationParams,
        sink: &mut S,
    ) -> Result<Generation, GenerateError> {
        self.generate_with_system(backend, None, prompt, params, sink)
    }

    /// Like [`Session::generate`], but first submits `system` as a
    /// protected prefix and seals the system boundary behind it, so
    /// eviction never touches those positions.
    pub fn generate_with_system<B: ModelBackend, S: ChunkSink>(
        &mut self,
        backend: &mut B,
        system: Option<&str>,
        prompt: &str,
        params: &GenerationParams,
        sink: &mut S,
    ) -> Result<Generation, GenerateError> {
        self.reset(backend);

        if let Some(system) = system.filter(|s| !s.is_empty()) {
            let tokens = backend
                .tokenize(system)
                .map_err(GenerateError::Tokenization)?;
            self.history.push(Message::new(Role::System, system));
            self.submit_prompt(backend, &tokens, false)?;
            self.window.seal_system_boundary();
        }

        let mut tokens = backend
            .tokenize(prompt)
            .map_err(GenerateError::Tokenization)?;
        if tokens.is_empty() {
            return Err(GenerateError::EmptyPrompt);
        }

        // Keep room for the reply: cap the prompt at what is left of
        // capacity - max_tokens - reserve, dropping trailing tokens.
        let max_prompt = self
            .window
            .capacity()
            .saturating_sub(self.window.cursor())
            .saturating_sub(params.max_tokens)
            .saturating_sub(EVICTION_RESERVE) as usize;
        if tokens.len() > max_prompt {
            tracing::warn!(
                "Prompt truncated from {} to {} tokens",
                tokens.len(),
                max_prompt
            );
            tokens.truncate(max_prompt);
            if tokens.is_empty() {
                return Err(GenerateError::EmptyPrompt);
            }
        }

        self.history.push(Message::new(Role::User, prompt));
        tracing::debug!("Submitting prompt of {} tokens", tokens.len());

        self.submit_prompt(backend, &tokens, true)?;
        let outcome = self.run_token_loop(backend, params, sink)?;

        self.history
            .push(Message::new(Role::Assistant, outcome.text.clone()));
        Ok(outcome)
    }

    /// Feeds the prompt to the model in batches of at most `batch_limit`
    /// tokens. Eviction is checked at every chunk boundary, never inside
    /// a chunk; only the final entry of the final chunk requests logits.
    fn submit_prompt<B: ModelBackend>(
        &mut self,
        backend: &mut B,
        tokens: &[Token],
        last_wants_output: bool,
    ) -> Result<(), GenerateError> {
        let mut submitted = 0;
        for chunk in tokens.chunks(self.batcher.batch_limit()) {
            self.evict_if_needed(backend, chunk.len())
                .map_err(GenerateError::PromptDecode)?;

            submitted += chunk.len();
            let is_last = submitted == tokens.len();
            let batch = self
                .batcher
                .single(chunk, self.window.cursor(), last_wants_output && is_last);
            backend
                .decode(&batch)
                .map_err(GenerateError::PromptDecode)?;
            self.window.advance(chunk.len())?;
        }
        Ok(())
    }

    fn run_token_loop<B: ModelBackend, S: ChunkSink>(
        &mut self,
        backend: &mut B,
        params: &GenerationParams,
        sink: &mut S,
    ) -> Result<Generation, GenerateError> {
        let mut assembler = StreamAssembler::new();
        let mut chunks: Vec<String> = Vec::new();
        let mut tokens_generated = 0u32;
        let mut reason = StopReason::BudgetExhausted;

        for _ in 0..params.max_tokens {
            let token = backend.sample();
            backend.accept(token);

            if backend.is_stop(token) {
                tracing::debug!("End of generation token encountered");
                reason = StopReason::StopToken;
                break;
            }
            tokens_generated += 1;

            match backend.token_bytes(token) {
                Ok(bytes) => assembler.push(&bytes),
                Err(e) => {
                    reason = StopReason::DecodeFailed(e);
                    break;
                }
            }

            // Chunk delivery is the only point where the consumer gets
            // control; a Stop verdict here means no further batch is
            // submitted.
            if let Some(chunk) = assembler.drain() {
                let verdict = sink.deliver(&chunk);
                chunks.push(chunk);
                if verdict == SinkVerdict::Stop {
                    tracing::debug!("Consumer cancelled generation");
                    reason = StopReason::Cancelled;
                    break;
                }
            }

            if let Err(e) = self.evict_if_needed(backend, 1) {
                reason = StopReason::DecodeFailed(e);
                break;
            }

            let batch = self.batcher.single(&[token], self.window.cursor(), true);
            if let Err(e) = backend.decode(&batch) {
                tracing::error!("Decode failed during generation: {e}");
                reason = StopReason::DecodeFailed(e);
                break;
            }
            self.window.advance(1)?;
        }

        // A cancelled consumer gets nothing more; otherwise flush what is
        // left in the assembler, dropping any undecodable tail.
        if reason != StopReason::Cancelled {
            if let Some(tail) = assembler.finish() {
                let _ = sink.deliver(&tail);
                chunks.push(tail);
            }
        }

        Ok(Generation {
            text: chunks.concat(),
            chunks,
            reason,
            tokens_generated,
        })
    }

    fn evict_if_needed<B: ModelBackend>(
        &mut self,
        backend: &mut B,
        pending: usize,
    ) -> Result<(), String> {
        if self.window.should_evict(pending) {
            if let Some(shift) = self.window.evict() {
                backend.shift(&shift)?;
            }
        }
        Ok(())
    }
}
