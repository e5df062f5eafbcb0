use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{BUCKET_DATA, Store};

const STATE_VERSION: &str = "1.0";

/// Key of the agent state record in the data bucket
pub const STATE_KEY: &str = "agent_state";

/// Poll bookkeeping persisted across restarts
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AgentState {
    /// State version
    pub version: String,

    /// Unique identifier for this machine
    pub machine_id: String,

    /// Last time the agent tried to poll
    pub last_poll_attempt: Option<DateTime<Utc>>,

    /// Last poll that returned a decodable response
    pub last_successful_poll: Option<DateTime<Utc>>,

    #[serde(default)]
    pub poll_count: u64,

    #[serde(default)]
    pub actions_processed: u64,

    /// Last time the agent announced itself to the control plane
    pub registered_at: Option<DateTime<Utc>>,
}

impl AgentState {
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            machine_id: Uuid::new_v4().to_string(),
            last_poll_attempt: None,
            last_successful_poll: None,
            poll_count: 0,
            actions_processed: 0,
            registered_at: None,
        }
    }

    /// Load agent state from the store
    pub fn load(store: &Store) -> Result<Option<Self>> {
        let state: Option<AgentState> = store
            .get_json(BUCKET_DATA, STATE_KEY)
            .context("Failed to read agent state")?;

        match state {
            Some(state) if state.version != STATE_VERSION => {
                tracing::warn!(
                    "Agent state version mismatch (expected {}, got {}). Treating as new state.",
                    STATE_VERSION,
                    state.version
                );
                Ok(None)
            }
            other => Ok(other),
        }
    }

    pub fn load_or_new(store: &Store) -> Result<Self> {
        Ok(Self::load(store)?.unwrap_or_default())
    }

    /// Save agent state to the store
    pub fn save(&self, store: &Store) -> Result<()> {
        store
            .set_json(BUCKET_DATA, STATE_KEY, self)
            .context("Failed to save agent state")
    }

    pub fn record_attempt(&mut self) {
        self.last_poll_attempt = Some(Utc::now());
    }

    pub fn record_success(&mut self) {
        self.last_successful_poll = self.last_poll_attempt.or_else(|| Some(Utc::now()));
        self.poll_count += 1;
    }

    pub fn record_processed(&mut self, count: usize) {
        self.actions_processed += count as u64;
    }

    pub fn record_registered(&mut self) {
        self.registered_at = Some(Utc::now());
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}
