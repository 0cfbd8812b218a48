//! Agent Integration Module
//!
//! Conversation types and the lifecycle seam the external agent loop calls into.
//! The loop itself, the chat-completion client and the tool registry live outside
//! this crate.

pub mod hook;
pub mod message;

pub use hook::ModelHook;
pub use message::{Message, ToolCall};
