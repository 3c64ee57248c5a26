//! llama.cpp backend
//!
//! [`InferenceBackend`] implementation on top of llama-cpp-2.
//!
//! # Architecture
//!
//! llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) contain
//! raw pointers that are not `Send`, so all native calls run on a dedicated
//! worker thread owned by this backend. Commands cross over an std channel;
//! token fragments cross back over a bounded tokio channel via
//! `blocking_send`, which is what lets the async session apply backpressure
//! and observe cancellation between fragments.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use once_cell::sync::OnceCell;
use tokio::sync::mpsc as tokio_mpsc;
use tokio::sync::oneshot;

use crate::hardware::EngineParameters;
use crate::inference::backend::{
    BackendError, BackendEvent, GenerationRequest, InferenceBackend, FRAGMENT_CHANNEL_CAPACITY,
};
use crate::types::ChatMessage;

/// llama.cpp convention for "offload everything"
const ALL_GPU_LAYERS: u32 = 1_000_000;

const TOP_K: i32 = 40;
const TOP_P: f32 = 0.95;

/// One ggml backend per process; a second session reuses the first handle.
static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn global_backend() -> Result<&'static LlamaBackend, BackendError> {
    BACKEND.get_or_try_init(|| {
        LlamaBackend::init().map_err(|e| BackendError::Construction(e.to_string()))
    })
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Load {
        path: PathBuf,
        params: EngineParameters,
        resp: oneshot::Sender<Result<(), BackendError>>,
    },
    Unload,
    CountTokens {
        text: String,
        resp: oneshot::Sender<Result<usize, BackendError>>,
    },
    RenderChat {
        messages: Vec<ChatMessage>,
        resp: oneshot::Sender<Result<String, BackendError>>,
    },
    Generate {
        request: GenerationRequest,
        events: tokio_mpsc::Sender<BackendEvent>,
    },
    Shutdown,
}

/// llama.cpp-backed [`InferenceBackend`] with a dedicated worker thread
pub struct LlamaCppBackend {
    command_tx: Option<Sender<WorkerCommand>>,
    worker: Option<JoinHandle<()>>,
    loaded: bool,
}

impl LlamaCppBackend {
    /// Spawn the worker thread; the native handle stays unloaded until `load`.
    pub fn new() -> Self {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let worker = thread::spawn(move || worker_main(command_rx));

        Self {
            command_tx: Some(command_tx),
            worker: Some(worker),
            loaded: false,
        }
    }

    fn command_tx(&self) -> Result<&Sender<WorkerCommand>, BackendError> {
        self.command_tx
            .as_ref()
            .ok_or_else(|| BackendError::Worker("worker thread is gone".to_string()))
    }

    /// Send a command carrying a response channel and await the answer.
    ///
    /// The response crosses back over a oneshot so a long native call (model
    /// loads can take minutes) suspends the calling task instead of parking
    /// a runtime thread.
    async fn roundtrip<T>(
        &mut self,
        make: impl FnOnce(oneshot::Sender<Result<T, BackendError>>) -> WorkerCommand + Send,
    ) -> Result<T, BackendError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.command_tx()?
            .send(make(resp_tx))
            .map_err(|e| BackendError::Worker(e.to_string()))?;
        resp_rx
            .await
            .map_err(|e| BackendError::Worker(e.to_string()))?
    }
}

impl Default for LlamaCppBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LlamaCppBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[async_trait]
impl InferenceBackend for LlamaCppBackend {
    async fn load(&mut self, path: &Path, params: &EngineParameters) -> Result<(), BackendError> {
        let result = self
            .roundtrip(|resp| WorkerCommand::Load {
                path: path.to_path_buf(),
                params: params.clone(),
                resp,
            })
            .await;

        // The worker frees any previous handle before constructing the new
        // one, so a failed load leaves nothing loaded
        self.loaded = result.is_ok();
        result
    }

    fn unload(&mut self) {
        if let Some(tx) = &self.command_tx {
            let _ = tx.send(WorkerCommand::Unload);
        }
        self.loaded = false;
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    async fn count_tokens(&mut self, text: &str) -> Result<usize, BackendError> {
        self.roundtrip(|resp| WorkerCommand::CountTokens {
            text: text.to_string(),
            resp,
        })
        .await
    }

    async fn render_chat(&mut self, messages: &[ChatMessage]) -> Result<String, BackendError> {
        self.roundtrip(|resp| WorkerCommand::RenderChat {
            messages: messages.to_vec(),
            resp,
        })
        .await
    }

    fn begin_generate(
        &mut self,
        request: GenerationRequest,
    ) -> Result<tokio_mpsc::Receiver<BackendEvent>, BackendError> {
        if !self.loaded {
            return Err(BackendError::NotLoaded);
        }

        let (events_tx, events_rx) = tokio_mpsc::channel(FRAGMENT_CHANNEL_CAPACITY);
        self.command_tx()?
            .send(WorkerCommand::Generate {
                request,
                events: events_tx,
            })
            .map_err(|e| BackendError::Worker(e.to_string()))?;

        Ok(events_rx)
    }
}

// =============================================================================
// Worker thread
// =============================================================================

struct WorkerState {
    model: Option<LlamaModel>,
    params: Option<EngineParameters>,
}

impl WorkerState {
    fn model(&self) -> Result<&LlamaModel, BackendError> {
        self.model.as_ref().ok_or(BackendError::NotLoaded)
    }
}

fn worker_main(command_rx: Receiver<WorkerCommand>) {
    let mut state = WorkerState {
        model: None,
        params: None,
    };

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Load { path, params, resp }) => {
                let result = load_model(&mut state, &path, params);
                let _ = resp.send(result);
            }
            Ok(WorkerCommand::Unload) => {
                state.model = None;
                state.params = None;
                tracing::info!("Model unloaded in worker thread");
            }
            Ok(WorkerCommand::CountTokens { text, resp }) => {
                let _ = resp.send(count_tokens(&state, &text));
            }
            Ok(WorkerCommand::RenderChat { messages, resp }) => {
                let _ = resp.send(render_chat(&state, &messages));
            }
            Ok(WorkerCommand::Generate { request, events }) => {
                if let Err(e) = run_generation(&state, &request, &events) {
                    let _ = events.blocking_send(BackendEvent::Fault(e));
                }
            }
            Ok(WorkerCommand::Shutdown) | Err(_) => {
                tracing::debug!("llama worker thread shutting down");
                break;
            }
        }
    }
}

/// Load the model and validate the derived parameters by constructing a
/// trial context, so a configuration the engine rejects surfaces at load
/// time where the session can run its conservative retry.
fn load_model(
    state: &mut WorkerState,
    path: &Path,
    params: EngineParameters,
) -> Result<(), BackendError> {
    let backend = global_backend()?;

    // Loading over an existing handle frees it first
    state.model = None;
    state.params = None;

    let gpu_layers = match params.n_gpu_layers {
        -1 => ALL_GPU_LAYERS,
        n => n.max(0) as u32,
    };

    let mut model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
    if params.use_mlock {
        model_params = model_params.with_use_mlock(true);
    }

    let model = LlamaModel::load_from_file(backend, path, &model_params)
        .map_err(|e| BackendError::Construction(e.to_string()))?;

    let ctx_params = build_context_params(&params);
    let trial_ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| BackendError::Construction(e.to_string()))?;
    drop(trial_ctx);

    tracing::info!(
        model = %path.display(),
        n_ctx = params.n_ctx,
        n_batch = params.n_batch,
        n_gpu_layers = params.n_gpu_layers,
        flash_attn = params.flash_attn,
        kv_cache = ?params.kv_cache_type,
        "Model loaded"
    );

    state.model = Some(model);
    state.params = Some(params);
    Ok(())
}

fn build_context_params(params: &EngineParameters) -> LlamaContextParams {
    // llama-cpp-2 exposes no type_k/type_v setters, so the KV quantization
    // mode and mmap flag stop here; the remaining knobs map directly.
    LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(params.n_ctx))
        .with_n_batch(params.n_batch)
        .with_n_threads(params.n_threads)
        .with_n_threads_batch(params.n_threads_batch)
        .with_flash_attention_policy(if params.flash_attn { 1 } else { 0 })
}

fn count_tokens(state: &WorkerState, text: &str) -> Result<usize, BackendError> {
    let tokens = state
        .model()?
        .str_to_token(text, AddBos::Always)
        .map_err(|e| BackendError::Tokenization(e.to_string()))?;
    Ok(tokens.len())
}

fn render_chat(state: &WorkerState, messages: &[ChatMessage]) -> Result<String, BackendError> {
    let model = state.model()?;

    let template = model
        .chat_template(None)
        .map_err(|e| BackendError::Tokenization(format!("no chat template: {e}")))?;

    let chat: Vec<LlamaChatMessage> = messages
        .iter()
        .map(|m| LlamaChatMessage::new(m.role.as_str().to_string(), m.content.clone()))
        .collect::<Result<_, _>>()
        .map_err(|e| BackendError::Tokenization(e.to_string()))?;

    model
        .apply_chat_template(&template, &chat, true)
        .map_err(|e| BackendError::Tokenization(e.to_string()))
}

/// Decode the prompt and stream sampled tokens until EOG, budget, a stop
/// sequence, cancellation, or a dropped receiver.
fn run_generation(
    state: &WorkerState,
    request: &GenerationRequest,
    events: &tokio_mpsc::Sender<BackendEvent>,
) -> Result<(), BackendError> {
    let model = state.model()?;
    let params = state.params.as_ref().ok_or(BackendError::NotLoaded)?;
    let backend = global_backend()?;

    // Fresh context per generation: positions restart at zero and the KV
    // cache of the previous request is gone.
    let mut ctx = model
        .new_context(backend, build_context_params(params))
        .map_err(|e| BackendError::Construction(e.to_string()))?;

    let prompt_tokens = model
        .str_to_token(&request.prompt, AddBos::Always)
        .map_err(|e| BackendError::Tokenization(e.to_string()))?;

    tracing::debug!(
        prompt_tokens = prompt_tokens.len(),
        max_tokens = request.max_tokens,
        "Starting decode"
    );

    let n_batch = (params.n_batch as usize).max(1);
    let mut batch = LlamaBatch::new(n_batch, 1);

    // Prefill in n_batch-sized chunks; only the last prompt token needs logits
    let mut pos: i32 = 0;
    let last_index = prompt_tokens.len() as i32 - 1;
    for chunk in prompt_tokens.chunks(n_batch) {
        batch.clear();
        for (i, token) in chunk.iter().enumerate() {
            let abs = pos + i as i32;
            batch
                .add(*token, abs, &[0], abs == last_index)
                .map_err(|e| BackendError::Decode(e.to_string()))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        pos += chunk.len() as i32;
    }

    let mut sampler = if request.temperature < 0.01 {
        LlamaSampler::greedy()
    } else {
        LlamaSampler::chain_simple([
            LlamaSampler::top_k(TOP_K),
            LlamaSampler::top_p(TOP_P, 1),
            LlamaSampler::temp(request.temperature),
            LlamaSampler::dist(rand_seed()),
        ])
    };

    // Longest stop marker minus one: text inside this tail is withheld until
    // it can no longer be the start of a split stop sequence
    let holdback = request
        .stop_sequences
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| s.len())
        .max()
        .map_or(0, |n| n - 1);

    let mut n_decoded = prompt_tokens.len() as i32;
    let mut utf8_buffer: Vec<u8> = Vec::new();
    let mut accumulated = String::new();
    let mut emitted = 0usize;
    let mut flush_tail = true;

    for _ in 0..request.max_tokens {
        if request.cancel.is_cancelled() {
            tracing::debug!("Generation cancelled");
            flush_tail = false;
            break;
        }

        let new_token = sampler.sample(&ctx, batch.n_tokens() - 1);
        sampler.accept(new_token);

        if model.is_eog_token(new_token) {
            break;
        }

        let token_bytes = model
            .token_to_bytes(new_token, Special::Tokenize)
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        utf8_buffer.extend_from_slice(&token_bytes);

        // Emit the longest valid UTF-8 prefix, keep the incomplete tail
        let valid_len = match std::str::from_utf8(&utf8_buffer) {
            Ok(_) => utf8_buffer.len(),
            Err(e) => e.valid_up_to(),
        };
        if valid_len > 0 {
            let piece = String::from_utf8_lossy(&utf8_buffer[..valid_len]).into_owned();
            utf8_buffer.drain(..valid_len);
            accumulated.push_str(&piece);

            // A stop sequence may span fragment boundaries, so search the
            // whole accumulated text; the holdback guarantees a match starts
            // at or after the emitted prefix
            if let Some(stop_at) = earliest_stop(&accumulated, &request.stop_sequences) {
                if stop_at > emitted {
                    let _ = events.blocking_send(BackendEvent::Fragment(
                        accumulated[emitted..stop_at].to_string(),
                    ));
                }
                flush_tail = false;
                break;
            }

            let safe = safe_emit_len(&accumulated, holdback);
            if safe > emitted {
                if events
                    .blocking_send(BackendEvent::Fragment(accumulated[emitted..safe].to_string()))
                    .is_err()
                {
                    tracing::debug!("Fragment receiver dropped, stopping generation");
                    flush_tail = false;
                    break;
                }
                emitted = safe;
            }
        }

        batch.clear();
        batch
            .add(new_token, n_decoded, &[0], true)
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        ctx.decode(&mut batch)
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        n_decoded += 1;
    }

    // Withheld holdback tail is real output when generation ended naturally
    if flush_tail && accumulated.len() > emitted {
        let _ = events.blocking_send(BackendEvent::Fragment(accumulated[emitted..].to_string()));
    }

    let _ = events.blocking_send(BackendEvent::Done);
    Ok(())
}

/// Byte index of the earliest stop-sequence match, if any
fn earliest_stop(text: &str, stop_sequences: &[String]) -> Option<usize> {
    stop_sequences
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
}

/// Longest emittable prefix of `text` with `holdback` bytes withheld,
/// adjusted down to a char boundary
fn safe_emit_len(text: &str, holdback: usize) -> usize {
    let mut safe = text.len().saturating_sub(holdback);
    while safe > 0 && !text.is_char_boundary(safe) {
        safe -= 1;
    }
    safe
}

/// Random seed from system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_backend_is_unloaded() {
        let backend = LlamaCppBackend::new();
        assert!(!backend.is_loaded());
    }

    #[test]
    fn test_unload_without_model_is_idempotent() {
        let mut backend = LlamaCppBackend::new();
        backend.unload();
        backend.unload();
        assert!(!backend.is_loaded());
    }

    #[test]
    fn test_earliest_stop_picks_first_match() {
        let stops = vec!["</s>".to_string(), "\n\n".to_string()];
        assert_eq!(earliest_stop("hello\n\nworld</s>", &stops), Some(5));
        assert_eq!(earliest_stop("plain text", &stops), None);
        assert_eq!(earliest_stop("text", &[String::new()]), None);
    }

    #[test]
    fn test_safe_emit_len_holds_back_tail() {
        assert_eq!(safe_emit_len("hello</", 3), 4);
        assert_eq!(safe_emit_len("hi", 0), 2);
        assert_eq!(safe_emit_len("a", 5), 0);
    }

    #[test]
    fn test_safe_emit_len_respects_char_boundaries() {
        // "é" is two bytes; withholding one byte must not split it
        assert_eq!(safe_emit_len("abé", 1), 2);
    }

    #[test]
    fn test_split_stop_is_never_partially_emitted() {
        // "\n\n" arriving across two fragments: the first "\n" stays inside
        // the holdback window, and once the stop completes the match point
        // equals the emitted prefix, so no stop bytes ever reach the consumer
        let stops = vec!["\n\n".to_string()];
        let holdback = 1;

        let mut accumulated = String::from("hello\n");
        assert_eq!(earliest_stop(&accumulated, &stops), None);
        let emitted = safe_emit_len(&accumulated, holdback);
        assert_eq!(&accumulated[..emitted], "hello");

        accumulated.push_str("\nworld");
        let stop_at = earliest_stop(&accumulated, &stops).expect("completed stop");
        assert_eq!(stop_at, emitted);
    }
}
