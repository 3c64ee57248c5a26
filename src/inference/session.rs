//! Inference session
//!
//! Owns one loaded model handle and everything around a generation request:
//! parameter derivation at load time (with a one-shot conservative retry),
//! the per-request token budget, the single-writer generation gate, and the
//! streaming loop with cooperative cancellation and decode-fault containment.
//!
//! Exactly one generation runs against the native handle at any time: every
//! entry point takes the session mutex, and streaming holds the owned guard
//! until the stream finishes, errors, or is cancelled.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::hardware::{self, EngineParameters, ParameterError, ParameterOverrides};
use crate::inference::backend::{
    BackendError, BackendEvent, CancelFlag, GenerationRequest, InferenceBackend,
    FRAGMENT_CHANNEL_CAPACITY,
};
use crate::inference::llama::LlamaCppBackend;
use crate::types::ChatMessage;

/// Headroom reserved for chat-template control tokens and KV-cache rounding
pub const SAFETY_MARGIN: u32 = 200;

/// Smallest generation budget worth starting at all
pub const MINIMUM_FLOOR: u32 = 50;

/// Terminal fragment emitted when the decode layer faults mid-generation
const DECODE_FAULT_NOTICE: &str = "\n\n⚠️ Memory limit reached: the model could not \
finish this response because its context limit was exceeded while generating. \
Try a question that needs less context.";

/// Errors surfaced by the session
#[derive(Debug, Error, Clone)]
pub enum SessionError {
    /// Generation was requested before `load`
    #[error("no model loaded; call load() first")]
    NotLoaded,

    /// The model path does not exist on disk
    #[error("model not found: {0}")]
    ModelNotFound(PathBuf),

    /// A caller override failed validation
    #[error("invalid parameter override: {0}")]
    InvalidOverride(#[from] ParameterError),

    /// The engine rejected both the derived and the conservative parameters
    #[error("engine rejected parameters: {0}")]
    EngineConstruction(String),

    /// The prompt leaves no room to generate; pick a smaller prompt
    #[error(
        "context exhausted: the prompt needs {prompt_tokens} of {context_length} \
         context tokens, leaving less than the {MINIMUM_FLOOR}-token generation floor"
    )]
    ContextExhausted {
        prompt_tokens: usize,
        context_length: u32,
    },

    /// Unexpected native-engine failure
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<BackendError> for SessionError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Construction(msg) => SessionError::EngineConstruction(msg),
            BackendError::NotLoaded => SessionError::NotLoaded,
            other => SessionError::Backend(other.to_string()),
        }
    }
}

/// What the session serves.
///
/// Vision is a configuration branch, not a subtype: it selects the loader
/// path that drops KV-cache quantization and flash-attention, which vision
/// projector stacks reject in practice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Modality {
    #[default]
    Text,
    Vision,
}

/// Per-request sampling knobs
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    /// Requested generation cap; `None` uses the profile default. The
    /// effective cap is always further limited by the token budget.
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: f32,
    /// Stop sequences ending generation early
    pub stop_sequences: Vec<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: None,
            temperature: 0.7,
            stop_sequences: Vec::new(),
        }
    }
}

/// Events yielded by a [`TokenStream`]
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A generated text fragment
    Token(String),
    /// Generation finished cleanly
    Done,
    /// Generation aborted with an unexpected error
    Error(SessionError),
}

/// A finite, non-restartable sequence of generated fragments.
///
/// Dropping the stream early cancels the generation at the next token
/// boundary and releases the session gate.
#[derive(Debug)]
pub struct TokenStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl TokenStream {
    /// Next event, or `None` once the stream is exhausted
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Drain the stream into a single string
    pub async fn collect_text(mut self) -> Result<String, SessionError> {
        let mut out = String::new();
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Token(text) => out.push_str(&text),
                StreamEvent::Done => break,
                StreamEvent::Error(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

struct SessionInner {
    backend: Box<dyn InferenceBackend>,
    params: Option<EngineParameters>,
    model_path: Option<PathBuf>,
}

/// The mutable, long-lived serving unit: one model handle, its current
/// parameters, and the generation gate.
pub struct InferenceSession {
    inner: Arc<Mutex<SessionInner>>,
    modality: Modality,
}

enum PromptInput {
    Chat(Vec<ChatMessage>),
    Raw(String),
}

impl InferenceSession {
    /// Session backed by llama.cpp, constructed unloaded
    pub fn new(modality: Modality) -> Self {
        Self::with_backend(Box::new(LlamaCppBackend::new()), modality)
    }

    /// Session over an explicit backend (the seam used by tests)
    pub fn with_backend(backend: Box<dyn InferenceBackend>, modality: Modality) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner {
                backend,
                params: None,
                model_path: None,
            })),
            modality,
        }
    }

    /// Load (or switch to) the model at `path`.
    ///
    /// Profiles the hardware for this specific model, applies overrides, and
    /// constructs the native handle. If the engine rejects the derived
    /// parameters, retries exactly once with the conservative variant before
    /// surfacing the error. Loading a different path over a loaded session
    /// tears the old handle down first, so parameters are never stale across
    /// model switches.
    pub async fn load(
        &self,
        path: &Path,
        overrides: Option<&ParameterOverrides>,
    ) -> Result<(), SessionError> {
        if !path.exists() {
            return Err(SessionError::ModelNotFound(path.to_path_buf()));
        }

        let mut inner = self.inner.lock().await;

        if let Some(current) = &inner.model_path {
            if current != path {
                tracing::info!(
                    from = %current.display(),
                    to = %path.display(),
                    "Switching models, unloading current handle"
                );
                inner.backend.unload();
                inner.params = None;
                inner.model_path = None;
            }
        }

        let mut params = hardware::profile_for_model(path);

        if self.modality == Modality::Vision {
            params = params.conservative();
        }

        if let Some(overrides) = overrides {
            params = params.with_overrides(overrides)?;
        }

        match inner.backend.load(path, &params).await {
            Ok(()) => {}
            Err(BackendError::Construction(first)) => {
                tracing::warn!(
                    error = %first,
                    "Engine rejected derived parameters, retrying with conservative set"
                );
                let fallback = params.conservative();
                if let Err(e) = inner.backend.load(path, &fallback).await {
                    // The backend destroyed any previous handle on the way
                    // in, so the session no longer holds a loaded model
                    inner.params = None;
                    inner.model_path = None;
                    return Err(e.into());
                }
                params = fallback;
            }
            Err(e) => {
                inner.params = None;
                inner.model_path = None;
                return Err(e.into());
            }
        }

        inner.params = Some(params);
        inner.model_path = Some(path.to_path_buf());
        Ok(())
    }

    /// Release the native handle. Idempotent; always succeeds.
    pub async fn unload(&self) {
        let mut inner = self.inner.lock().await;
        inner.backend.unload();
        inner.params = None;
        inner.model_path = None;
    }

    pub async fn is_loaded(&self) -> bool {
        self.inner.lock().await.backend.is_loaded()
    }

    /// Parameters of the currently loaded model, if any
    pub async fn parameters(&self) -> Option<EngineParameters> {
        self.inner.lock().await.params.clone()
    }

    /// Streaming chat completion with the full token-budget and cancellation
    /// protocol. The returned stream is finite and non-restartable.
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        options: GenerationOptions,
        cancel: CancelFlag,
    ) -> Result<TokenStream, SessionError> {
        let guard = self.inner.clone().lock_owned().await;
        start_stream(guard, PromptInput::Chat(messages.to_vec()), options, cancel).await
    }

    /// Chat completion collected into one string
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        options: GenerationOptions,
    ) -> Result<String, SessionError> {
        let stream = self.chat_stream(messages, options, CancelFlag::new()).await?;
        stream.collect_text().await
    }

    /// Single-shot completion over a raw prompt (no chat template)
    pub async fn complete(
        &self,
        prompt: &str,
        options: GenerationOptions,
    ) -> Result<String, SessionError> {
        let guard = self.inner.clone().lock_owned().await;
        let stream = start_stream(
            guard,
            PromptInput::Raw(prompt.to_string()),
            options,
            CancelFlag::new(),
        )
        .await?;
        stream.collect_text().await
    }
}

/// Run the token-budget protocol and start the generation while holding the
/// gate. The owned guard moves into the forwarding task and is released on
/// every exit path: completion, fault, cancellation, or a dropped stream.
async fn start_stream(
    mut guard: OwnedMutexGuard<SessionInner>,
    input: PromptInput,
    options: GenerationOptions,
    cancel: CancelFlag,
) -> Result<TokenStream, SessionError> {
    if !guard.backend.is_loaded() {
        return Err(SessionError::NotLoaded);
    }
    let Some(params) = guard.params.clone() else {
        return Err(SessionError::NotLoaded);
    };

    let (prompt, prompt_tokens) = render_and_count(&mut guard, &input).await;

    let n_ctx = params.n_ctx;
    let available = n_ctx as i64 - prompt_tokens as i64 - SAFETY_MARGIN as i64;

    if available < MINIMUM_FLOOR as i64 {
        tracing::warn!(
            prompt_tokens,
            n_ctx,
            available,
            "Rejecting request before generation: context exhausted"
        );
        return Err(SessionError::ContextExhausted {
            prompt_tokens,
            context_length: n_ctx,
        });
    }

    let requested = options.max_tokens.unwrap_or(params.max_tokens_default);
    let effective_max_tokens = (requested as i64).min(available) as u32;

    let request_id = Uuid::new_v4();
    tracing::info!(
        %request_id,
        prompt_tokens,
        n_ctx,
        available,
        requested,
        effective_max_tokens,
        "Starting generation"
    );

    let backend_rx = guard
        .backend
        .begin_generate(GenerationRequest {
            prompt,
            max_tokens: effective_max_tokens,
            temperature: options.temperature,
            stop_sequences: options.stop_sequences,
            cancel: cancel.clone(),
        })
        .map_err(SessionError::from)?;

    let (out_tx, out_rx) = mpsc::channel(FRAGMENT_CHANNEL_CAPACITY);

    tokio::spawn(forward_events(guard, backend_rx, out_tx, cancel, request_id));

    Ok(TokenStream { rx: out_rx })
}

/// Forward backend events to the consumer, translating decode faults into a
/// terminal diagnostic fragment. Holds the session guard for its whole life.
async fn forward_events(
    guard: OwnedMutexGuard<SessionInner>,
    mut backend_rx: mpsc::Receiver<BackendEvent>,
    out_tx: mpsc::Sender<StreamEvent>,
    cancel: CancelFlag,
    request_id: Uuid,
) {
    while let Some(event) = backend_rx.recv().await {
        match event {
            BackendEvent::Fragment(text) => {
                if cancel.is_cancelled() {
                    tracing::debug!(%request_id, "Generation cancelled by caller");
                    break;
                }
                if out_tx.send(StreamEvent::Token(text)).await.is_err() {
                    // Consumer dropped the stream; stop the worker too
                    cancel.cancel();
                    tracing::debug!(%request_id, "Stream dropped, cancelling generation");
                    break;
                }
            }
            BackendEvent::Done => {
                tracing::debug!(%request_id, "Generation finished");
                let _ = out_tx.send(StreamEvent::Done).await;
                break;
            }
            BackendEvent::Fault(BackendError::Decode(e)) => {
                // KV-cache exhaustion despite the pre-flight check; end the
                // stream cleanly with one diagnostic fragment
                tracing::warn!(%request_id, error = %e, "Decode fault during generation");
                let _ = out_tx
                    .send(StreamEvent::Token(DECODE_FAULT_NOTICE.to_string()))
                    .await;
                let _ = out_tx.send(StreamEvent::Done).await;
                break;
            }
            BackendEvent::Fault(e) => {
                tracing::error!(%request_id, error = %e, "Backend fault during generation");
                let _ = out_tx.send(StreamEvent::Error(e.into())).await;
                break;
            }
        }
    }

    drop(guard);
}

/// Render the prompt and count its tokens, degrading to a pessimistic
/// length/3 estimate when the template or tokenizer cannot answer.
async fn render_and_count(
    guard: &mut OwnedMutexGuard<SessionInner>,
    input: &PromptInput,
) -> (String, usize) {
    match input {
        PromptInput::Chat(messages) => match guard.backend.render_chat(messages).await {
            Ok(rendered) => {
                let count = match guard.backend.count_tokens(&rendered).await {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!(error = %e, "Tokenization failed, estimating");
                        estimate_tokens(&rendered)
                    }
                };
                (rendered, count)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Chat template unavailable, using transcript");
                let transcript = fallback_transcript(messages);
                let serialized = serde_json::to_string(messages)
                    .unwrap_or_else(|_| transcript.clone());
                let count = estimate_tokens(&serialized);
                (transcript, count)
            }
        },
        PromptInput::Raw(prompt) => {
            let count = match guard.backend.count_tokens(prompt).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(error = %e, "Tokenization failed, estimating");
                    estimate_tokens(prompt)
                }
            };
            (prompt.clone(), count)
        }
    }
}

/// Conservative token estimate: ~3 characters per token, leaning pessimistic
/// to avoid overflow
fn estimate_tokens(text: &str) -> usize {
    text.len() / 3
}

/// Plain role-prefixed transcript for models without a chat template
fn fallback_transcript(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str(message.role.as_str());
        out.push_str(": ");
        out.push_str(&message.content);
        out.push('\n');
    }
    out.push_str("assistant: ");
    out
}
