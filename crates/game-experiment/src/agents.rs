//! LLM-backed agents for the manager, the player and the simulated human.
//!
//! All three are the same [`ChatAgent`] with a different [`RoleMapping`]:
//! the manager and the simulated human take part in a conversation and see
//! its turns as-is, while the player observes the game from outside and
//! gets every request labeled with who sent it.

use anyhow::Result;
use async_trait::async_trait;
use experiment_kernel::{Agent, AgentConfig, AgentReply, ChatRole, ChatTurn, LlmCallRecord};
use tracing::debug;

use crate::openai_client::OpenAiClient;

/// Prefix for manager requests in the player's prompt.
pub const MANAGER_LABEL: &str = "[GAME MANAGER]: ";

/// How a prompt is relabeled before it is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleMapping {
    /// Sent unchanged.
    Participant,
    /// User turns are labeled as coming from the game manager.
    Observer,
}

impl RoleMapping {
    pub fn apply(&self, prompt: &[ChatTurn]) -> Vec<ChatTurn> {
        match self {
            Self::Participant => prompt.to_vec(),
            Self::Observer => prompt
                .iter()
                .map(|turn| match turn.role {
                    ChatRole::User => ChatTurn::user(format!("{MANAGER_LABEL}{}", turn.content)),
                    _ => turn.clone(),
                })
                .collect(),
        }
    }
}

/// An [`Agent`] that answers through an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct ChatAgent {
    name: String,
    client: OpenAiClient,
    mapping: RoleMapping,
}

impl ChatAgent {
    pub fn new(name: impl Into<String>, client: OpenAiClient, mapping: RoleMapping) -> Self {
        Self {
            name: name.into(),
            client,
            mapping,
        }
    }

    pub fn participant(name: impl Into<String>, client: OpenAiClient) -> Self {
        Self::new(name, client, RoleMapping::Participant)
    }

    pub fn observer(name: impl Into<String>, client: OpenAiClient) -> Self {
        Self::new(name, client, RoleMapping::Observer)
    }
}

#[async_trait]
impl Agent for ChatAgent {
    async fn respond(&self, prompt: &[ChatTurn], config: &AgentConfig) -> Result<AgentReply> {
        let messages = self.mapping.apply(prompt);
        let completion = self
            .client
            .complete(&config.model, &messages, config.temperature, config.max_tokens)
            .await?;

        debug!(
            agent = %self.name,
            model = %config.model,
            prompt_tokens = completion.input_tokens,
            completion_tokens = completion.output_tokens,
            "chat completion"
        );

        Ok(AgentReply {
            call: LlmCallRecord::new(
                config,
                &messages,
                completion.input_tokens,
                completion.output_tokens,
            ),
            text: completion.text,
        })
    }
}
