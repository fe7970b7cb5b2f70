//! The append-only record of one session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::LlmCallRecord;
use crate::config::AgentConfig;
use crate::protocol::TurnOutcome;
use crate::variables::ConditionSet;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    Manager,
    Human,
    Player,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manager => write!(f, "manager"),
            Self::Human => write!(f, "human"),
            Self::Player => write!(f, "player"),
        }
    }
}

/// One utterance in the session log.
///
/// Internal messages (raw manager output, player decisions) are kept with
/// `visible == false` and never shown to the human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub role: MessageRole,
    pub text: String,
    pub visible: bool,
}

impl ProtocolMessage {
    pub fn visible(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            visible: true,
        }
    }

    pub fn internal(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            visible: false,
        }
    }
}

/// Full record of a session: conditions, configs, messages, calls and token totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub scenario: String,
    pub conditions: ConditionSet,
    pub manager_config: AgentConfig,
    pub player_config: AgentConfig,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    messages: Vec<ProtocolMessage>,
    calls: Vec<LlmCallRecord>,
    total_input_tokens: u64,
    total_output_tokens: u64,
}

impl Transcript {
    pub fn new(
        scenario: impl Into<String>,
        conditions: ConditionSet,
        manager_config: AgentConfig,
        player_config: AgentConfig,
    ) -> Self {
        Self {
            scenario: scenario.into(),
            conditions,
            manager_config,
            player_config,
            started_at: Utc::now(),
            ended_at: None,
            messages: Vec::new(),
            calls: Vec::new(),
            total_input_tokens: 0,
            total_output_tokens: 0,
        }
    }

    /// Append everything a resolved turn produced, in order.
    pub fn record(&mut self, outcome: TurnOutcome) {
        self.messages.extend(outcome.messages);
        for call in outcome.calls {
            self.record_call(call);
        }
    }

    pub fn record_call(&mut self, call: LlmCallRecord) {
        self.total_input_tokens += call.input_tokens;
        self.total_output_tokens += call.output_tokens;
        self.calls.push(call);
    }

    pub fn messages(&self) -> &[ProtocolMessage] {
        &self.messages
    }

    pub fn visible_messages(&self) -> impl Iterator<Item = &ProtocolMessage> {
        self.messages.iter().filter(|m| m.visible)
    }

    pub fn calls(&self) -> &[LlmCallRecord] {
        &self.calls
    }

    pub fn total_input_tokens(&self) -> u64 {
        self.total_input_tokens
    }

    pub fn total_output_tokens(&self) -> u64 {
        self.total_output_tokens
    }

    pub fn finish(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ChatTurn;

    fn call(input: u64, output: u64) -> LlmCallRecord {
        LlmCallRecord::new(
            &AgentConfig::manager("m"),
            &[ChatTurn::system("m")],
            input,
            output,
        )
    }

    fn transcript() -> Transcript {
        Transcript::new(
            "test",
            ConditionSet::default(),
            AgentConfig::manager("m"),
            AgentConfig::player("p"),
        )
    }

    #[test]
    fn test_record_appends_and_totals() {
        let mut t = transcript();
        t.record(TurnOutcome {
            text: "AI offers 40".to_string(),
            messages: vec![
                ProtocolMessage::visible(MessageRole::Human, "hi"),
                ProtocolMessage::internal(MessageRole::Player, "OFFER 40"),
                ProtocolMessage::visible(MessageRole::Manager, "AI offers 40"),
            ],
            calls: vec![call(10, 5), call(3, 2)],
            player_requested: true,
            decisions: Vec::new(),
        });
        assert_eq!(t.messages().len(), 3);
        assert_eq!(t.visible_messages().count(), 2);
        assert_eq!(t.calls().len(), 2);
        assert_eq!(t.total_input_tokens(), 13);
        assert_eq!(t.total_output_tokens(), 7);
    }

    #[test]
    fn test_finish_is_stamped_once() {
        let mut t = transcript();
        assert!(!t.is_finished());
        t.finish();
        let first = t.ended_at;
        t.finish();
        assert_eq!(t.ended_at, first);
    }

    #[test]
    fn test_message_serialization() {
        let msg = ProtocolMessage::internal(MessageRole::Player, "OFFER 40");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"role":"player","text":"OFFER 40","visible":false}"#);
    }
}
