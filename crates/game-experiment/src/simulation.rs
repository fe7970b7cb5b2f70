//! A language model standing in for the human participant.

use std::sync::Arc;

use anyhow::{Context, Result};
use experiment_kernel::{Agent, AgentConfig, AgentReply, ChatTurn, MessageRole, ProtocolMessage};

/// Plays the human side of a session.
///
/// It sees only what a real participant would see: the visible messages,
/// with its own as assistant turns and everything else as user turns.
pub struct SimulatedHuman {
    agent: Arc<dyn Agent>,
    config: AgentConfig,
}

impl SimulatedHuman {
    pub fn new(agent: Arc<dyn Agent>, config: AgentConfig) -> Self {
        Self { agent, config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn prompt(&self, history: &[ProtocolMessage]) -> Vec<ChatTurn> {
        std::iter::once(ChatTurn::system(&self.config.system_prompt))
            .chain(history.iter().filter(|m| m.visible).map(|m| match m.role {
                MessageRole::Human => ChatTurn::assistant(&m.text),
                MessageRole::Manager | MessageRole::Player => ChatTurn::user(&m.text),
            }))
            .collect()
    }

    /// Produce the next human message for the given session history.
    pub async fn reply(&self, history: &[ProtocolMessage]) -> Result<AgentReply> {
        let prompt = self.prompt(history);
        self.agent
            .respond(&prompt, &self.config)
            .await
            .context("simulated human call failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use experiment_kernel::LlmCallRecord;

    struct Fixed;

    #[async_trait]
    impl Agent for Fixed {
        async fn respond(&self, prompt: &[ChatTurn], config: &AgentConfig) -> Result<AgentReply> {
            Ok(AgentReply {
                text: format!("seen {}", prompt.len()),
                call: LlmCallRecord::new(config, prompt, 0, 0),
            })
        }
    }

    fn history() -> Vec<ProtocolMessage> {
        vec![
            ProtocolMessage::visible(MessageRole::Manager, "Welcome. AI offers $40."),
            ProtocolMessage::internal(MessageRole::Player, "OFFER 40"),
            ProtocolMessage::visible(MessageRole::Human, "reject"),
            ProtocolMessage::visible(MessageRole::Manager, "Round 2."),
        ]
    }

    #[test]
    fn test_prompt_role_mapping() {
        let human = SimulatedHuman::new(Arc::new(Fixed), AgentConfig::manager("Your valuation is $8."));
        assert_eq!(
            human.prompt(&history()),
            vec![
                ChatTurn::system("Your valuation is $8."),
                ChatTurn::user("Welcome. AI offers $40."),
                ChatTurn::assistant("reject"),
                ChatTurn::user("Round 2."),
            ]
        );
    }

    #[tokio::test]
    async fn test_reply_uses_visible_history() {
        let human = SimulatedHuman::new(Arc::new(Fixed), AgentConfig::manager("h"));
        let reply = human.reply(&history()).await.unwrap();
        assert_eq!(reply.text, "seen 4");
        assert_eq!(reply.call.prompt.len(), 4);
    }
}
