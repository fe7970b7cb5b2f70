//! Sessions and the keyed store that holds them.
//!
//! A [`Session`] ties one realized scenario to a [`Transcript`] and a
//! [`TurnResolver`]. Turns are all-or-nothing: a turn that fails anywhere
//! appends nothing, so the transcript never holds a half-resolved message.

use std::sync::Arc;

use anyhow::{bail, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::agent::Agent;
use crate::config::ScenarioBundle;
use crate::protocol::TurnResolver;
use crate::transcript::Transcript;
use crate::variables::ConditionSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Active,
    Ended,
}

#[derive(Debug)]
pub struct Session {
    id: Uuid,
    status: SessionStatus,
    opening_instruction: String,
    transcript: Transcript,
    resolver: TurnResolver,
}

impl Session {
    /// Build a session from a scenario and the conditions drawn for it.
    ///
    /// The bundle's templates are filled here; pass the unrealized bundle.
    pub fn new(
        bundle: &ScenarioBundle,
        conditions: ConditionSet,
        manager: Arc<dyn Agent>,
        player: Arc<dyn Agent>,
    ) -> Self {
        let realized = bundle.realize(&conditions);
        let resolver = TurnResolver::new(manager, player).with_markers(realized.markers.clone());
        let transcript = Transcript::new(
            realized.name.clone(),
            conditions,
            realized.manager,
            realized.player,
        );
        Self {
            id: Uuid::new_v4(),
            status: SessionStatus::Created,
            opening_instruction: realized.opening_instruction,
            transcript,
            resolver,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn resolver(&self) -> &TurnResolver {
        &self.resolver
    }

    pub fn into_transcript(self) -> Transcript {
        self.transcript
    }

    /// Run the opening instruction and return the manager's first visible message.
    ///
    /// A failed opening leaves the session `Created`, so it can be retried.
    pub async fn open(&mut self) -> Result<String> {
        if self.status != SessionStatus::Created {
            bail!("session {} already opened", self.id);
        }
        let outcome = self
            .resolver
            .resolve_opening(
                &self.opening_instruction,
                &self.transcript.manager_config,
                &self.transcript.player_config,
            )
            .await?;
        let text = outcome.text.clone();
        self.transcript.record(outcome);
        self.status = SessionStatus::Active;
        info!(session = %self.id, scenario = %self.transcript.scenario, "session opened");
        Ok(text)
    }

    /// Process one human message and return the manager's visible reply.
    pub async fn respond(&mut self, human_text: &str) -> Result<String> {
        match self.status {
            SessionStatus::Active => {}
            SessionStatus::Created => bail!("session {} has not been opened", self.id),
            SessionStatus::Ended => bail!("session {} has ended", self.id),
        }
        let outcome = self
            .resolver
            .resolve_human_turn(
                human_text,
                self.transcript.messages(),
                &self.transcript.manager_config,
                &self.transcript.player_config,
            )
            .await?;
        let text = outcome.text.clone();
        self.transcript.record(outcome);
        Ok(text)
    }

    pub fn end(&mut self) {
        if self.status != SessionStatus::Ended {
            self.status = SessionStatus::Ended;
            self.transcript.finish();
            info!(
                session = %self.id,
                messages = self.transcript.messages().len(),
                "session ended"
            );
        }
    }
}

pub type SharedSession = Arc<Mutex<Session>>;

/// Keyed storage for live sessions.
pub trait SessionStore: Send + Sync {
    fn create(&self, session: Session) -> Uuid;
    fn get(&self, id: Uuid) -> Option<SharedSession>;
    fn delete(&self, id: Uuid) -> Option<SharedSession>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-local store; nothing outlives the process.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<Uuid, SharedSession>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn create(&self, session: Session) -> Uuid {
        let id = session.id();
        self.sessions.insert(id, Arc::new(Mutex::new(session)));
        info!(session = %id, live = self.sessions.len(), "session created");
        id
    }

    fn get(&self, id: Uuid) -> Option<SharedSession> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    fn delete(&self, id: Uuid) -> Option<SharedSession> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}
