//! Batch runner for simulated game sessions.
//!
//! Orchestrates the experiment lifecycle:
//! 1. Compile the scenario's variable design (configuration errors stop here)
//! 2. Assign conditions to every session (sampled or factorial)
//! 3. Run sessions concurrently: opening, then simulated human turns
//! 4. Collect transcripts and summary statistics

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use experiment_kernel::{
    substitute, Agent, AgentConfig, ConditionSet, ConditionValue, ExperimentDesign, LlmCallRecord,
    ScenarioBundle, Session,
};

use crate::results::{BatchResults, SessionResult};
use crate::simulation::SimulatedHuman;

/// How sessions get their conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesignMode {
    /// Independent draws, one per session.
    Sampled { sessions: usize },
    /// Every factorial cell, `repetitions` sessions each.
    Factorial { repetitions: usize },
}

/// Configuration for the experiment runner.
#[derive(Debug, Clone)]
pub struct ExperimentRunnerConfig {
    pub mode: DesignMode,
    /// Simulated human turns after the opening
    pub max_turns: usize,
    /// Sessions running at once
    pub max_concurrent_sessions: usize,
    /// Base seed; session `i` draws from `seed + i`
    pub seed: u64,
    /// Values forced onto every session after drawing
    pub overrides: BTreeMap<String, ConditionValue>,
}

impl Default for ExperimentRunnerConfig {
    fn default() -> Self {
        Self {
            mode: DesignMode::Sampled { sessions: 1 },
            max_turns: 5,
            max_concurrent_sessions: 4,
            seed: 0,
            overrides: BTreeMap::new(),
        }
    }
}

/// The three model-backed roles of a simulated session.
#[derive(Clone)]
pub struct AgentSet {
    pub manager: Arc<dyn Agent>,
    pub player: Arc<dyn Agent>,
    pub human: Arc<dyn Agent>,
}

/// One session's assignment before it runs.
#[derive(Debug, Clone)]
struct SessionPlan {
    index: usize,
    seed: u64,
    conditions: ConditionSet,
}

pub struct ExperimentRunner {
    config: ExperimentRunnerConfig,
    agents: AgentSet,
}

impl ExperimentRunner {
    pub fn new(config: ExperimentRunnerConfig, agents: AgentSet) -> Self {
        Self { config, agents }
    }

    /// Condition sets for every session of the batch, in session order.
    pub fn plan(&self, design: &ExperimentDesign) -> Result<Vec<ConditionSet>> {
        Ok(self
            .plan_sessions(design)?
            .into_iter()
            .map(|p| p.conditions)
            .collect())
    }

    fn plan_sessions(&self, design: &ExperimentDesign) -> Result<Vec<SessionPlan>> {
        let seed_for = |index: usize| self.config.seed.wrapping_add(index as u64);
        let plans = match self.config.mode {
            DesignMode::Sampled { sessions } => (0..sessions)
                .map(|index| {
                    let seed = seed_for(index);
                    let mut rng = ChaCha8Rng::seed_from_u64(seed);
                    let conditions = design
                        .draw(index, &mut rng)
                        .with_context(|| format!("Failed to draw conditions for session {index}"))?;
                    Ok(SessionPlan {
                        index,
                        seed,
                        conditions,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            DesignMode::Factorial { repetitions } => {
                let cells = design.factorial().context("Failed to build factorial design")?;
                cells
                    .iter()
                    .flat_map(|cell| std::iter::repeat_n(cell, repetitions))
                    .enumerate()
                    .map(|(index, cell)| SessionPlan {
                        index,
                        seed: seed_for(index),
                        conditions: cell.clone(),
                    })
                    .collect()
            }
        };

        Ok(plans
            .into_iter()
            .map(|plan| SessionPlan {
                conditions: plan.conditions.with_overrides(&self.config.overrides),
                ..plan
            })
            .collect())
    }

    /// Run the whole batch.
    ///
    /// Fails only for problems that affect every session (invalid variable
    /// definitions, no simulated human). A failing session is recorded with
    /// its error and the others continue.
    pub async fn run(&self, bundle: &ScenarioBundle) -> Result<BatchResults> {
        let design = ExperimentDesign::compile(&bundle.variables)
            .with_context(|| format!("Invalid variables in scenario '{}'", bundle.name))?;
        let Some(human_template) = bundle.human.as_ref() else {
            anyhow::bail!(
                "Scenario '{}' has no simulated human instructions",
                bundle.name
            );
        };

        let plans = self.plan_sessions(&design)?;
        let total = plans.len();
        info!(
            scenario = %bundle.name,
            sessions = total,
            max_turns = self.config.max_turns,
            concurrency = self.config.max_concurrent_sessions,
            "Starting batch"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_sessions.max(1)));
        let sessions = self
            .run_sessions(bundle, human_template, plans, semaphore)
            .await?;

        let mut results = BatchResults::new(bundle.name.clone(), self.config.seed);
        for result in sessions {
            results.add(result);
        }
        results.finish();

        info!(
            completed = results.summary.completed,
            failed = results.summary.failed,
            input_tokens = results.summary.total_input_tokens,
            output_tokens = results.summary.total_output_tokens,
            "Batch complete"
        );
        Ok(results)
    }

    /// Run every planned session, at most as many at once as `semaphore` has permits.
    async fn run_sessions(
        &self,
        bundle: &ScenarioBundle,
        human_template: &AgentConfig,
        plans: Vec<SessionPlan>,
        semaphore: Arc<Semaphore>,
    ) -> Result<Vec<SessionResult>> {
        let total = plans.len();
        let futures: Vec<_> = plans
            .into_iter()
            .map(|plan| {
                let semaphore = semaphore.clone();
                async move {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .context("Session semaphore closed")?;
                    anyhow::Ok(self.run_session(bundle, human_template, plan, total).await)
                }
            })
            .collect();

        join_all(futures).await.into_iter().collect()
    }

    async fn run_session(
        &self,
        bundle: &ScenarioBundle,
        human_template: &AgentConfig,
        plan: SessionPlan,
        total: usize,
    ) -> SessionResult {
        let human_config = AgentConfig {
            system_prompt: substitute(&human_template.system_prompt, &plan.conditions),
            ..human_template.clone()
        };
        let human = SimulatedHuman::new(self.agents.human.clone(), human_config);
        let mut session = Session::new(
            bundle,
            plan.conditions.clone(),
            self.agents.manager.clone(),
            self.agents.player.clone(),
        );
        let session_id = session.id();

        let mut human_calls = Vec::new();
        let mut turns = 0;
        let outcome = self
            .drive(&mut session, &human, &mut human_calls, &mut turns)
            .await;
        session.end();

        let error = match outcome {
            Ok(()) => {
                info!(
                    progress = format!("{}/{}", plan.index + 1, total),
                    session = %session_id,
                    turns,
                    "Completed session"
                );
                None
            }
            Err(e) => {
                let message = format!("{e:#}");
                warn!(session = %session_id, index = plan.index, error = %message, "Session failed");
                Some(message)
            }
        };

        SessionResult {
            index: plan.index,
            session_id,
            seed: plan.seed,
            conditions: plan.conditions,
            turns,
            transcript: session.into_transcript(),
            human_calls,
            error,
        }
    }

    async fn drive(
        &self,
        session: &mut Session,
        human: &SimulatedHuman,
        human_calls: &mut Vec<LlmCallRecord>,
        turns: &mut usize,
    ) -> Result<()> {
        session.open().await?;
        for _ in 0..self.config.max_turns {
            let reply = human.reply(session.transcript().messages()).await?;
            human_calls.push(reply.call);
            session.respond(reply.text.trim()).await?;
            *turns += 1;
        }
        Ok(())
    }
}
