//! Scripted in-process agents shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use experiment_kernel::{Agent, AgentConfig, AgentReply, ChatTurn, LlmCallRecord};

/// Replays a fixed list of replies and records every prompt it receives.
///
/// `Err` entries become agent failures. Running out of replies is a failure too.
pub struct ScriptedAgent {
    replies: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<Vec<ChatTurn>>>,
}

impl ScriptedAgent {
    pub fn new<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Arc<Self> {
        Self::with_results(replies.into_iter().map(|r| Ok(r.into())))
    }

    pub fn with_results(replies: impl IntoIterator<Item = Result<String, String>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub async fn prompts(&self) -> Vec<Vec<ChatTurn>> {
        self.prompts.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.prompts.lock().await.len()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn respond(&self, prompt: &[ChatTurn], config: &AgentConfig) -> Result<AgentReply> {
        self.prompts.lock().await.push(prompt.to_vec());
        let next = self
            .replies
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| anyhow!("script exhausted"))?;
        let text = next.map_err(|e| anyhow!(e))?;
        Ok(AgentReply {
            call: LlmCallRecord::new(config, prompt, prompt.len() as u64 * 10, text.len() as u64),
            text,
        })
    }
}

pub fn manager_config() -> AgentConfig {
    AgentConfig::manager("You run an ultimatum game.")
}

pub fn player_config() -> AgentConfig {
    AgentConfig::player("You are the AI player. Answer with OFFER <n>.")
}

/// Wrap a decision context in the default request markers.
pub fn request(context: &str) -> String {
    format!("[PLAYER_TURN]\n{context}\n[/PLAYER_TURN]")
}
