//! Game Experiment: Manager/Player Games with Randomized Conditions
//!
//! This crate runs the experiment kernel against real models:
//! - An OpenAI-compatible client and the agents built on it
//! - Scenario files with prompts in Markdown
//! - Batch simulation with an LLM standing in for the human participant

pub mod agents;
pub mod experiment;
pub mod openai_client;
pub mod results;
pub mod scenario;
pub mod simulation;
