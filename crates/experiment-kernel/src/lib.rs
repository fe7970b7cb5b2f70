//! Experiment Kernel: Randomized Conditions and Manager/Player Turn Resolution
//!
//! This crate implements the core of a conversational experiment: drawing
//! per-session experimental conditions (including formula-derived ones) and
//! resolving turns in which a manager agent defers sub-decisions to an
//! isolated player agent.

pub mod agent;
pub mod config;
pub mod error;
pub mod formula;
pub mod protocol;
pub mod session;
pub mod template;
pub mod transcript;
pub mod variables;

pub use agent::{Agent, AgentReply, ChatRole, ChatTurn, LlmCallRecord};
pub use config::{AgentConfig, ScenarioBundle};
pub use error::{ConditionError, FormulaError};
pub use formula::{Formula, Number};
pub use protocol::{manager_prompt, PlayerContext, PlayerDecision, ProtocolMarkers, Resolution, TurnOutcome, TurnResolver};
pub use session::{InMemorySessionStore, Session, SessionStatus, SessionStore, SharedSession};
pub use template::substitute;
pub use transcript::{MessageRole, ProtocolMessage, Transcript};
pub use variables::{
    draw, factorial, ConditionSet, ConditionValue, ExperimentDesign, VariableDefinition, VariableKind,
};
