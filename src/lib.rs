//! tierllm Library
//!
//! Core library for serving a local LLM: profiles the host hardware, derives
//! llama.cpp engine parameters for it, and runs token-budgeted, cancellable
//! generation sessions.

pub mod hardware;
pub mod inference;
pub mod types;
