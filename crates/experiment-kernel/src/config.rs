//! Agent and scenario configuration.
//!
//! A [`ScenarioBundle`] is the fully loaded scenario handed to the kernel:
//! prompts for both agents, the opening instruction, the variable
//! definitions and the protocol markers. Loading it from disk is the
//! caller's job; the kernel assumes it is complete.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::protocol::ProtocolMarkers;
use crate::template::substitute;
use crate::variables::{ConditionSet, VariableDefinition};

pub const DEFAULT_MANAGER_MODEL: &str = "gpt-5-mini";
pub const DEFAULT_PLAYER_MODEL: &str = "gpt-5-nano";
pub const DEFAULT_TEMPERATURE: f32 = 1.0;
pub const DEFAULT_MANAGER_MAX_TOKENS: u32 = 2048;
pub const DEFAULT_PLAYER_MAX_TOKENS: u32 = 256;

pub const DEFAULT_OPENING_INSTRUCTION: &str = "[Start the game immediately. Display the rules, \
    initial state, and the first move. If the AI player moves first, include a [PLAYER_TURN] block.]";

/// Model settings and instructions for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub system_prompt: String,
    #[serde(default = "default_manager_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_manager_max_tokens")]
    pub max_tokens: u32,
}

fn default_manager_model() -> String {
    DEFAULT_MANAGER_MODEL.to_string()
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_manager_max_tokens() -> u32 {
    DEFAULT_MANAGER_MAX_TOKENS
}

fn default_player_model() -> String {
    DEFAULT_PLAYER_MODEL.to_string()
}

fn default_player_max_tokens() -> u32 {
    DEFAULT_PLAYER_MAX_TOKENS
}

/// `AgentConfig` as written in a scenario's `player` section, with player defaults.
#[derive(Deserialize)]
struct PlayerConfigFile {
    system_prompt: String,
    #[serde(default = "default_player_model")]
    model: String,
    #[serde(default = "default_temperature")]
    temperature: f32,
    #[serde(default = "default_player_max_tokens")]
    max_tokens: u32,
}

fn deserialize_player<'de, D: Deserializer<'de>>(deserializer: D) -> Result<AgentConfig, D::Error> {
    let file = PlayerConfigFile::deserialize(deserializer)?;
    Ok(AgentConfig {
        system_prompt: file.system_prompt,
        model: file.model,
        temperature: file.temperature,
        max_tokens: file.max_tokens,
    })
}

impl AgentConfig {
    /// Manager defaults around the given instructions.
    pub fn manager(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            model: DEFAULT_MANAGER_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MANAGER_MAX_TOKENS,
        }
    }

    /// Player defaults: a smaller model and short answers.
    pub fn player(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            model: DEFAULT_PLAYER_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_PLAYER_MAX_TOKENS,
        }
    }

    fn realized(&self, conditions: &ConditionSet) -> Self {
        Self {
            system_prompt: substitute(&self.system_prompt, conditions),
            ..self.clone()
        }
    }
}

/// A resolved scenario: everything needed to run sessions of one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioBundle {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub manager: AgentConfig,
    #[serde(deserialize_with = "deserialize_player")]
    pub player: AgentConfig,
    #[serde(default = "default_opening_instruction")]
    pub opening_instruction: String,
    #[serde(default)]
    pub variables: BTreeMap<String, VariableDefinition>,
    #[serde(default)]
    pub markers: ProtocolMarkers,
    /// Instructions for a simulated human participant, when sessions are run unattended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human: Option<AgentConfig>,
}

fn default_opening_instruction() -> String {
    DEFAULT_OPENING_INSTRUCTION.to_string()
}

impl ScenarioBundle {
    /// Return a copy with every prompt template filled from `conditions`.
    pub fn realize(&self, conditions: &ConditionSet) -> Self {
        Self {
            manager: self.manager.realized(conditions),
            player: self.player.realized(conditions),
            opening_instruction: substitute(&self.opening_instruction, conditions),
            human: self.human.as_ref().map(|h| h.realized(conditions)),
            ..self.clone()
        }
    }
}
