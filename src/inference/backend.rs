//! Backend seam
//!
//! The session talks to the native engine through the [`InferenceBackend`]
//! trait: load/unload, tokenization, chat-template rendering, and a streaming
//! generation entry point. Production uses the llama.cpp worker in
//! [`crate::inference::llama`]; tests substitute a mock.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::hardware::EngineParameters;
use crate::types::ChatMessage;

/// Bound on in-flight fragments between the generation worker and consumers
pub const FRAGMENT_CHANNEL_CAPACITY: usize = 32;

/// Errors raised by a native backend
#[derive(Debug, Error, Clone)]
pub enum BackendError {
    /// The engine rejected the computed parameters at construction time
    #[error("engine rejected configuration: {0}")]
    Construction(String),

    /// An operation that needs a model was called before load
    #[error("no model loaded")]
    NotLoaded,

    /// Tokenization or template rendering failed
    #[error("tokenization failed: {0}")]
    Tokenization(String),

    /// The decode layer faulted mid-generation (KV-cache exhaustion and kin)
    #[error("decode failed: {0}")]
    Decode(String),

    /// The worker thread is gone or unresponsive
    #[error("worker thread error: {0}")]
    Worker(String),
}

/// Cooperative cancellation flag for an in-flight generation.
///
/// Checked once per emitted fragment on both sides of the stream channel;
/// cancellation takes effect between token boundaries, never mid-token.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the generation this flag was passed to
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A single generation request handed to the backend
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Fully rendered prompt text
    pub prompt: String,
    /// Budget-capped generation limit
    pub max_tokens: u32,
    /// Sampling temperature (0.0 = greedy)
    pub temperature: f32,
    /// Stop sequences that end generation when produced
    pub stop_sequences: Vec<String>,
    /// Cooperative cancellation flag
    pub cancel: CancelFlag,
}

/// Events produced by an in-flight generation
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// A decoded text fragment (one or more tokens worth of valid UTF-8)
    Fragment(String),
    /// Generation finished normally (EOG, budget, stop sequence, or cancel)
    Done,
    /// Generation aborted with a fault
    Fault(BackendError),
}

/// Contract with the native model engine.
///
/// Implementations must be `Send`; the llama.cpp implementation keeps its
/// non-`Send` native handles on a dedicated worker thread behind channels.
/// The operations that wait on that thread are async so a slow native call
/// (a model load can take minutes) suspends the task instead of parking a
/// runtime thread.
#[async_trait]
pub trait InferenceBackend: Send {
    /// Construct the native handle for `path` with the given parameters.
    ///
    /// Loading over an existing handle replaces it; on failure the previous
    /// handle is gone and the backend reports unloaded.
    async fn load(&mut self, path: &Path, params: &EngineParameters) -> Result<(), BackendError>;

    /// Release the native handle. Idempotent.
    fn unload(&mut self);

    fn is_loaded(&self) -> bool;

    /// Exact token count of `text` under the loaded model's vocabulary
    async fn count_tokens(&mut self, text: &str) -> Result<usize, BackendError>;

    /// Render a message list through the model's chat template
    async fn render_chat(&mut self, messages: &[ChatMessage]) -> Result<String, BackendError>;

    /// Start a generation, returning the bounded fragment channel.
    ///
    /// The backend emits [`BackendEvent`]s from its own worker; dropping the
    /// receiver stops generation at the next token boundary.
    fn begin_generate(
        &mut self,
        request: GenerationRequest,
    ) -> Result<mpsc::Receiver<BackendEvent>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_roundtrip() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());

        let shared = flag.clone();
        shared.cancel();
        assert!(flag.is_cancelled());
    }
}
