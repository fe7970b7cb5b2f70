//! Manager/player turn resolution.
//!
//! The manager defers sub-decisions to the player by embedding request
//! blocks in its output:
//!
//! ```text
//! [PLAYER_TURN]
//! Round 1/4. Decide how much to offer. Respond with: OFFER <number>
//! [/PLAYER_TURN]
//! The AI player offers you ${PLAYER_DECISION} out of $100.
//! ```
//!
//! [`TurnResolver::resolve`] runs an explicit scan/dispatch/splice loop over
//! that text. Each request is sent to the player against its whole
//! accumulated [`PlayerContext`], the block is cut out, and the first
//! decision placeholder is replaced by the player's answer. Requests are
//! handled strictly left to right, one at a time.
//!
//! Unmatched markers are tolerated and logged: a request without a
//! placeholder just loses its decision, and a placeholder without a request
//! stays in the text.

use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agent::{Agent, AgentReply, ChatTurn, LlmCallRecord};
use crate::config::AgentConfig;
use crate::transcript::{MessageRole, ProtocolMessage};

static EXCESS_BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("blank line pattern is valid"));

/// The literal delimiters the manager's output must use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolMarkers {
    pub request_start: String,
    pub request_end: String,
    pub decision_placeholder: String,
}

impl Default for ProtocolMarkers {
    fn default() -> Self {
        Self {
            request_start: "[PLAYER_TURN]".to_string(),
            request_end: "[/PLAYER_TURN]".to_string(),
            decision_placeholder: "{PLAYER_DECISION}".to_string(),
        }
    }
}

/// Location of one complete request block in the manager's text.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestBlock {
    start: usize,
    end: usize,
    context_start: usize,
    context_end: usize,
}

enum Scan {
    Found(RequestBlock),
    Unterminated(usize),
    None,
}

impl ProtocolMarkers {
    fn scan(&self, text: &str, from: usize) -> Scan {
        let Some(rest) = text.get(from..) else {
            return Scan::None;
        };
        let Some(offset) = rest.find(&self.request_start) else {
            return Scan::None;
        };
        let start = from + offset;
        let context_start = start + self.request_start.len();
        match text[context_start..].find(&self.request_end) {
            Some(len) => Scan::Found(RequestBlock {
                start,
                end: context_start + len + self.request_end.len(),
                context_start,
                context_end: context_start + len,
            }),
            None => Scan::Unterminated(start),
        }
    }

    /// Strip every marker out of text spliced in from the player, so it can
    /// neither open a request nor capture a later decision.
    fn neutralize(&self, text: &str) -> String {
        text.replace(&self.request_start, "")
            .replace(&self.request_end, "")
            .replace(&self.decision_placeholder, "")
    }
}

/// The player's private conversation: its instructions, then one
/// request/decision pair per resolved request.
///
/// Never shown to the manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerContext {
    turns: Vec<ChatTurn>,
}

impl PlayerContext {
    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    fn seed(&mut self, system_prompt: &str) {
        if self.turns.is_empty() {
            self.turns.push(ChatTurn::system(system_prompt));
        }
    }
}

/// One resolved request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerDecision {
    pub context: String,
    pub decision: String,
}

/// Result of running the resolution loop over one manager output.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Manager text with every request spliced out and blank runs collapsed.
    pub text: String,
    pub calls: Vec<LlmCallRecord>,
    pub player_requested: bool,
    pub decisions: Vec<PlayerDecision>,
}

/// Everything one opening or human turn produced, for the caller to append.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// The human-visible manager text.
    pub text: String,
    pub messages: Vec<ProtocolMessage>,
    pub calls: Vec<LlmCallRecord>,
    pub player_requested: bool,
    pub decisions: Vec<PlayerDecision>,
}

/// Build the manager prompt from the full session history.
///
/// Internal messages are included, so the manager sees its own raw request
/// blocks and the player's decisions. The manager's own messages become
/// assistant turns; human and player messages become user turns.
pub fn manager_prompt(system_prompt: &str, history: &[ProtocolMessage]) -> Vec<ChatTurn> {
    std::iter::once(ChatTurn::system(system_prompt))
        .chain(history.iter().map(|m| match m.role {
            MessageRole::Manager => ChatTurn::assistant(&m.text),
            MessageRole::Human | MessageRole::Player => ChatTurn::user(&m.text),
        }))
        .collect()
}

fn collapse_blank_lines(text: &str) -> String {
    EXCESS_BLANK_LINES.replace_all(text, "\n\n").trim().to_string()
}

/// Drives the manager/player exchange for one session.
///
/// Holds the player's persistent context, which is the only state that
/// changes across calls. Session history is read, never written.
pub struct TurnResolver {
    manager: Arc<dyn Agent>,
    player: Arc<dyn Agent>,
    markers: ProtocolMarkers,
    player_context: PlayerContext,
}

impl std::fmt::Debug for TurnResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnResolver")
            .field("markers", &self.markers)
            .field("player_context_len", &self.player_context.len())
            .finish()
    }
}

impl TurnResolver {
    pub fn new(manager: Arc<dyn Agent>, player: Arc<dyn Agent>) -> Self {
        Self {
            manager,
            player,
            markers: ProtocolMarkers::default(),
            player_context: PlayerContext::default(),
        }
    }

    pub fn with_markers(mut self, markers: ProtocolMarkers) -> Self {
        self.markers = markers;
        self
    }

    pub fn markers(&self) -> &ProtocolMarkers {
        &self.markers
    }

    pub fn player_context(&self) -> &PlayerContext {
        &self.player_context
    }

    /// Run the scenario's opening instruction through the manager and resolve
    /// any requests in its output.
    pub async fn resolve_opening(
        &mut self,
        opening_instruction: &str,
        manager_config: &AgentConfig,
        player_config: &AgentConfig,
    ) -> Result<TurnOutcome> {
        let prompt = vec![
            ChatTurn::system(&manager_config.system_prompt),
            ChatTurn::user(opening_instruction),
        ];
        self.manager_round(Vec::new(), prompt, manager_config, player_config)
            .await
    }

    /// Process one human message: the manager sees the full history plus
    /// the new message, and its output is resolved.
    ///
    /// `history` is not modified; the caller appends the returned messages.
    pub async fn resolve_human_turn(
        &mut self,
        human_text: &str,
        history: &[ProtocolMessage],
        manager_config: &AgentConfig,
        player_config: &AgentConfig,
    ) -> Result<TurnOutcome> {
        let human = ProtocolMessage::visible(MessageRole::Human, human_text);
        let mut prompt = manager_prompt(&manager_config.system_prompt, history);
        prompt.push(ChatTurn::user(human_text));
        self.manager_round(vec![human], prompt, manager_config, player_config)
            .await
    }

    async fn manager_round(
        &mut self,
        mut messages: Vec<ProtocolMessage>,
        prompt: Vec<ChatTurn>,
        manager_config: &AgentConfig,
        player_config: &AgentConfig,
    ) -> Result<TurnOutcome> {
        let reply = self
            .manager
            .respond(&prompt, manager_config)
            .await
            .context("manager agent call failed")?;

        let resolution = self.resolve(&reply.text, player_config).await?;

        let mut calls = Vec::with_capacity(resolution.calls.len() + 1);
        calls.push(reply.call);
        calls.extend(resolution.calls);

        if resolution.player_requested {
            messages.push(ProtocolMessage::internal(MessageRole::Manager, &reply.text));
            messages.extend(
                resolution
                    .decisions
                    .iter()
                    .map(|d| ProtocolMessage::internal(MessageRole::Player, &d.decision)),
            );
        }
        messages.push(ProtocolMessage::visible(MessageRole::Manager, &resolution.text));

        Ok(TurnOutcome {
            text: resolution.text,
            messages,
            calls,
            player_requested: resolution.player_requested,
            decisions: resolution.decisions,
        })
    }

    /// Resolve every request block in `manager_text`, left to right.
    ///
    /// A player failure aborts the whole resolution; no partially spliced
    /// text is returned and the player context is rolled back to where it
    /// was before the first request, so a retry is well-formed.
    pub async fn resolve(&mut self, manager_text: &str, player_config: &AgentConfig) -> Result<Resolution> {
        let before = self.player_context.len();
        let resolution = self.resolve_requests(manager_text, player_config).await;
        if resolution.is_err() {
            self.player_context.turns.truncate(before);
        }
        resolution
    }

    async fn resolve_requests(
        &mut self,
        manager_text: &str,
        player_config: &AgentConfig,
    ) -> Result<Resolution> {
        let placeholder = self.markers.decision_placeholder.clone();
        let mut text = manager_text.to_string();
        let mut cursor = 0;
        let mut calls = Vec::new();
        let mut decisions = Vec::new();

        loop {
            let block = match self.markers.scan(&text, cursor) {
                Scan::Found(block) => block,
                Scan::Unterminated(at) => {
                    warn!(offset = at, "request start marker without end marker, leaving text as-is");
                    break;
                }
                Scan::None => break,
            };

            let context = text[block.context_start..block.context_end].trim().to_string();
            debug!(
                request = decisions.len() + 1,
                context_len = context.len(),
                "dispatching player request"
            );
            let reply = self.ask_player(&context, player_config).await?;
            let decision = self.markers.neutralize(reply.text.trim());

            text.replace_range(block.start..block.end, "");
            cursor = block.start;

            match text.find(&placeholder) {
                Some(at) => {
                    text.replace_range(at..at + placeholder.len(), &decision);
                    if at < cursor {
                        cursor = (cursor + decision.len()).saturating_sub(placeholder.len());
                    }
                }
                None => warn!(
                    request = decisions.len() + 1,
                    "request block without decision placeholder, decision not shown"
                ),
            }

            calls.push(reply.call);
            decisions.push(PlayerDecision { context, decision });
        }

        if text.contains(&placeholder) {
            warn!("decision placeholder without matching request block");
        }
        if text.contains(&self.markers.request_end) && !text.contains(&self.markers.request_start) {
            warn!("request end marker without start marker");
        }

        Ok(Resolution {
            text: collapse_blank_lines(&text),
            player_requested: !decisions.is_empty(),
            calls,
            decisions,
        })
    }

    /// Ask the player against its whole history and remember the answer.
    async fn ask_player(&mut self, context: &str, config: &AgentConfig) -> Result<AgentReply> {
        self.player_context.seed(&config.system_prompt);
        self.player_context.turns.push(ChatTurn::user(context));

        let reply = self
            .player
            .respond(self.player_context.turns(), config)
            .await
            .context("player agent call failed")?;
        self.player_context
            .turns
            .push(ChatTurn::assistant(&reply.text));
        Ok(reply)
    }
}
