//! Agent Lifecycle Hooks
//!
//! The external agent loop calls registered hooks after each model response.

use async_trait::async_trait;

use super::message::Message;

/// Hook invoked after the model has produced a candidate assistant message.
///
/// A hook may append messages to the conversation; it must never remove or
/// rewrite existing ones. Hooks are best-effort: they report what they did
/// through `Outcome` instead of returning errors to the agent loop.
#[async_trait]
pub trait ModelHook: Send + Sync {
    type Outcome: Send;

    /// Get the hook name for logging
    fn name(&self) -> &'static str;

    async fn after_model(&self, conversation: &mut Vec<Message>) -> Self::Outcome;
}
