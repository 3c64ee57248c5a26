//! Shared types
//!
//! Defines chat message structures used across the session and backend layers.

pub mod message;

pub use message::{ChatMessage, Role};
