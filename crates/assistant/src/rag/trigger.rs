//! Retrieval Trigger
//!
//! Decides, after each model turn, whether the draft answer is operational
//! advice that should be checked against the knowledge base. When it is, the
//! closest runbook chunks are retrieved and appended to the conversation as a
//! follow-up instruction so the next model turn can reconcile the two.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::retriever::{context_block, Retriever, CONTEXT_MARKER};
use crate::agent::{Message, ModelHook};
use crate::config::TriggerConfig;
use crate::metrics::RAG_TRIGGER_TOTAL;

const PLAN_EXCERPT_CHARS: usize = 500;
const ANSWER_EXCERPT_CHARS: usize = 300;

const DEFAULT_PHRASES: &[&str] = &[
    "建议行动方案",
    "建议",
    "操作步骤",
    "最佳实践",
    "标准流程",
    "运维手册",
    "解决方案",
    "处理方案",
    "action plan",
    "recommendation",
    "recommended actions",
    "next steps",
    "best practice",
    "standard procedure",
    "runbook",
    "solution",
    "remediation",
];

const DEFAULT_PLAN_MARKERS: &[&str] = &["建议行动方案", "action plan", "recommended actions"];

/// A single trigger phrase and whether it is active
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRule {
    pub phrase: String,
    pub enabled: bool,
}

impl TriggerRule {
    pub fn new(phrase: impl Into<String>, enabled: bool) -> Self {
        Self {
            phrase: phrase.into(),
            enabled,
        }
    }
}

/// Ordered phrase table plus the markers that introduce an action plan.
///
/// Matching lowercases ASCII only, so "Action Plan" matches `action plan`
/// while CJK phrases match exactly.
#[derive(Debug, Clone)]
pub struct TriggerRules {
    phrases: Vec<TriggerRule>,
    plan_markers: Vec<String>,
}

impl Default for TriggerRules {
    fn default() -> Self {
        Self {
            phrases: DEFAULT_PHRASES
                .iter()
                .map(|phrase| TriggerRule::new(*phrase, true))
                .collect(),
            plan_markers: DEFAULT_PLAN_MARKERS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

impl TriggerRules {
    /// Replace the phrase table, keeping the plan markers.
    pub fn with_phrases(mut self, phrases: Vec<TriggerRule>) -> Self {
        self.phrases = phrases;
        self
    }

    pub fn with_plan_markers(mut self, markers: Vec<String>) -> Self {
        self.plan_markers = markers;
        self
    }

    pub fn phrases(&self) -> &[TriggerRule] {
        &self.phrases
    }

    /// First enabled phrase found in `text`.
    pub fn matched_phrase(&self, text: &str) -> Option<&str> {
        let haystack = text.to_ascii_lowercase();
        self.phrases
            .iter()
            .filter(|rule| rule.enabled && !rule.phrase.is_empty())
            .find(|rule| haystack.contains(&rule.phrase.to_ascii_lowercase()))
            .map(|rule| rule.phrase.as_str())
    }

    pub fn matches(&self, text: &str) -> bool {
        self.matched_phrase(text).is_some()
    }

    /// Text from the earliest plan marker onwards, capped at 500 characters.
    pub fn plan_excerpt(&self, text: &str) -> Option<String> {
        // ASCII lowercasing preserves byte offsets, so positions map back onto `text`.
        let haystack = text.to_ascii_lowercase();
        self.plan_markers
            .iter()
            .filter(|marker| !marker.is_empty())
            .filter_map(|marker| haystack.find(&marker.to_ascii_lowercase()))
            .min()
            .map(|start| text[start..].chars().take(PLAN_EXCERPT_CHARS).collect())
    }
}

/// Why the policy declined to retrieve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    /// The conversation does not end with an assistant message.
    NotAssistantTurn,
    /// The assistant is answering our own knowledge-base instruction.
    AlreadyInjected,
    StoreNotReady,
    /// Tool results must follow the assistant turn before anything else.
    PendingToolCalls,
    NoTrigger,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::Disabled => "disabled",
            SkipReason::NotAssistantTurn => "not an assistant turn",
            SkipReason::AlreadyInjected => "already injected",
            SkipReason::StoreNotReady => "vector store not initialized",
            SkipReason::PendingToolCalls => "assistant turn has pending tool calls",
            SkipReason::NoTrigger => "no trigger matched",
        };
        write!(f, "{}", reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Skipped(SkipReason),
    NoContext,
    Injected { chunks: usize },
    Failed { reason: String },
}

impl TriggerOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TriggerOutcome::Skipped(_) => "skipped",
            TriggerOutcome::NoContext => "no_context",
            TriggerOutcome::Injected { .. } => "injected",
            TriggerOutcome::Failed { .. } => "failed",
        }
    }
}

/// After-model hook that splices knowledge-base procedures into the conversation
pub struct RagTrigger {
    retriever: Arc<Retriever>,
    config: TriggerConfig,
}

impl RagTrigger {
    pub fn new(retriever: Arc<Retriever>, config: TriggerConfig) -> Self {
        Self { retriever, config }
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    /// Decide whether the conversation's latest assistant message should
    /// trigger retrieval. Returns that message's content when it should.
    pub fn check<'a>(&self, conversation: &'a [Message]) -> Result<&'a str, SkipReason> {
        if !self.config.enabled {
            return Err(SkipReason::Disabled);
        }

        let Some((last, earlier)) = conversation.split_last() else {
            return Err(SkipReason::NotAssistantTurn);
        };
        let Message::Assistant {
            content,
            tool_calls,
        } = last
        else {
            return Err(SkipReason::NotAssistantTurn);
        };

        let preceding_user = earlier.iter().rev().find_map(|msg| match msg {
            Message::User { content } => Some(content.as_str()),
            _ => None,
        });
        if preceding_user.is_some_and(is_injected_instruction) {
            return Err(SkipReason::AlreadyInjected);
        }

        if !self.retriever.store().is_initialized() {
            return Err(SkipReason::StoreNotReady);
        }

        if !tool_calls.is_empty() {
            return Err(SkipReason::PendingToolCalls);
        }

        if let Some(phrase) = self.config.rules.matched_phrase(content) {
            debug!("Trigger phrase '{}' found in assistant message", phrase);
            return Ok(content);
        }

        // Fallback: a reasonably long final answer.
        match self.config.min_answer_chars {
            Some(min) if content.chars().count() > min => Ok(content),
            _ => Err(SkipReason::NoTrigger),
        }
    }

    /// Retrieval query for an assistant answer: the plan excerpt (or the start
    /// of the answer), prefixed by the user's original question when known.
    pub fn build_query(&self, conversation: &[Message], answer: &str) -> String {
        let excerpt = self
            .config
            .rules
            .plan_excerpt(answer)
            .unwrap_or_else(|| answer.chars().take(ANSWER_EXCERPT_CHARS).collect());

        match original_user_query(conversation) {
            Some(question) if !question.is_empty() => format!("{} {}", question, excerpt),
            _ => excerpt,
        }
    }

    /// Run the policy once against the conversation, appending at most one message.
    pub async fn evaluate(&self, conversation: &mut Vec<Message>) -> TriggerOutcome {
        let outcome = match self.check(conversation.as_slice()) {
            Err(reason) => {
                debug!("Knowledge-base retrieval skipped: {}", reason);
                TriggerOutcome::Skipped(reason)
            }
            Ok(answer) => {
                let query = self.build_query(conversation.as_slice(), answer);
                info!(
                    "Assistant is giving operational advice, searching knowledge base: {}",
                    query.chars().take(100).collect::<String>()
                );

                match self.retriever.try_retrieve(&query).await {
                    Ok(chunks) if chunks.is_empty() => {
                        info!("No relevant knowledge-base entries found");
                        TriggerOutcome::NoContext
                    }
                    Ok(chunks) => {
                        conversation.push(Message::user(enhancement_instruction(&context_block(&chunks))));
                        info!("Injected {} knowledge-base chunks into the conversation", chunks.len());
                        TriggerOutcome::Injected {
                            chunks: chunks.len(),
                        }
                    }
                    Err(e) => {
                        warn!("Knowledge-base retrieval failed, continuing without it: {}", e);
                        TriggerOutcome::Failed {
                            reason: e.to_string(),
                        }
                    }
                }
            }
        };

        RAG_TRIGGER_TOTAL.with_label_values(&[outcome.label()]).inc();
        outcome
    }
}

#[async_trait]
impl ModelHook for RagTrigger {
    type Outcome = TriggerOutcome;

    fn name(&self) -> &'static str {
        "rag_trigger"
    }

    async fn after_model(&self, conversation: &mut Vec<Message>) -> TriggerOutcome {
        self.evaluate(conversation).await
    }
}

fn is_injected_instruction(content: &str) -> bool {
    content.contains(CONTEXT_MARKER)
}

/// First user message, with any spliced knowledge-base block removed.
fn original_user_query(conversation: &[Message]) -> Option<&str> {
    conversation.iter().find_map(|msg| match msg {
        Message::User { content } => Some(
            content
                .split(CONTEXT_MARKER)
                .next()
                .unwrap_or_default()
                .trim(),
        ),
        _ => None,
    })
}

fn enhancement_instruction(context: &str) -> String {
    format!(
        "Refer to the standard procedures and best practices from the operations knowledge base below, \
and refine the recommended action plan in your answer:

{context}

Requirements:
1. Keep your recommendations consistent with the standard procedures in the knowledge base.
2. Where the knowledge base has matching standard operating steps, use them in preference to your own.
3. Combine your earlier analysis of the problem with the knowledge-base content to give a more precise recommendation.
4. If the knowledge base conflicts with your analysis, explain the conflict and state which course you recommend.
"
    )
}
