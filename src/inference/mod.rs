//! LLM inference
//!
//! This module owns the loaded model handle and everything between a chat
//! request and its token stream: engine parameter application, token-budget
//! checks, the single-writer generation gate, streaming and cancellation.

pub mod backend;
pub mod llama;
pub mod session;

pub use backend::{BackendError, BackendEvent, CancelFlag, GenerationRequest, InferenceBackend};
pub use session::{
    GenerationOptions, InferenceSession, Modality, SessionError, StreamEvent, TokenStream,
};
