//! The seam between the kernel and whatever actually calls a language model.
//!
//! The kernel never talks to a model directly. Both the manager and the
//! player are [`Agent`]s: given a prompt as chat turns and a config they
//! return text plus an [`LlmCallRecord`] describing the call.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;

/// Chat-completion role of a prompt turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One turn of a chat prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Immutable record of one model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCallRecord {
    pub model: String,
    /// The exact prompt sent.
    pub prompt: Vec<ChatTurn>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl LlmCallRecord {
    pub fn new(config: &AgentConfig, prompt: &[ChatTurn], input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            model: config.model.clone(),
            prompt: prompt.to_vec(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            input_tokens,
            output_tokens,
        }
    }
}

/// What an agent returns for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub text: String,
    pub call: LlmCallRecord,
}

/// Anything that can answer a chat prompt.
///
/// Implementations own their role mapping: the prompt they receive is
/// already ordered and role-tagged, and they may relabel it before sending.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn respond(&self, prompt: &[ChatTurn], config: &AgentConfig) -> Result<AgentReply>;
}
